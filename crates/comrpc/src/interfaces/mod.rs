//! Built-in marshalable interfaces
//!
//! Interface ids below [`FIRST_USER_INTERFACE`] are reserved for the
//! interfaces defined here, which every [`Administrator`] registers on
//! construction.

mod iterator;
mod remote_connection;

pub use iterator::{IteratorItem, IteratorProxy, IteratorStub, RemoteIterator, VecIterator};
pub use remote_connection::{RemoteConnection, RemoteConnectionProxy, RemoteConnectionStub};

use crate::administrator::Administrator;
use crate::types::InterfaceId;

pub const ID_REMOTE_CONNECTION: InterfaceId = 0x0000_0004;
pub const ID_STRING_ITERATOR: InterfaceId = 0x0000_0005;
pub const ID_VALUE_ITERATOR: InterfaceId = 0x0000_0006;

/// Lowest id available to application interfaces
pub const FIRST_USER_INTERFACE: InterfaceId = 0x0000_0100;

pub(crate) fn register_builtin(admin: &Administrator) {
    remote_connection::register(admin);
    iterator::register::<String>(admin);
    iterator::register::<u32>(admin);
}
