//! Identifier types
//!
//! - **InterfaceId**: stable `u32` per interface type, identical on both peers
//! - **InstanceId**: handle for an object lent to a peer; never dereferenced
//! - **MethodIndex**: ordinal within an interface's method table

use std::fmt;

/// Interface type identifier
pub type InterfaceId = u32;

/// Method ordinal within an interface
pub type MethodIndex = u16;

/// Channel identity, unique within a process
pub type ChannelId = u32;

/// Connection identity; doubles as the announce exchange id
pub type ConnectionId = u32;

/// Top bit of an interface id in a response tail marks a Release
pub const RELEASE_DIRECTION: u32 = 0x8000_0000;

/// Reserved method indices shared by every interface
pub mod method {
    use super::MethodIndex;

    pub const ADD_REF: MethodIndex = 0;
    pub const RELEASE: MethodIndex = 1;
    pub const QUERY_INTERFACE: MethodIndex = 2;

    /// First index available to interface-specific methods
    pub const FIRST: MethodIndex = 3;
}

/// Handle for an object in its owner's instance table
///
/// Packs a slot index (low 32 bits) and a generation (high 32 bits). The
/// generation changes every time a slot is reused, so a stale handle from
/// a peer never resolves to the wrong object. Generation 0 is never
/// allocated, which keeps the all-zero value free to mean "no instance".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InstanceId(u64);

impl InstanceId {
    pub const NULL: InstanceId = InstanceId(0);

    pub fn new(generation: u32, slot: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.generation(), self.slot())
    }
}
