//! Announce messages
//!
//! Request: `u8 kind | u32 exchange | u32 pid | u64 implementation |
//! u32 interface | u32 version | text class_name | text callsign`
//!
//! Response: `u32 result | u64 implementation | u32 interface | text proxy_stub_path`

use crate::types::{Error, ErrorCode, InstanceId, InterfaceId, Result};
use comrpc_frame::Frame;

/// What an announce asks for
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceKind {
    /// Handshake from a newly connected peer
    Request = 0,
    /// Instantiate a class on the receiving side
    Acquire = 1,
    /// Hand an interface to the receiving side after the handshake
    Offer = 2,
    /// Withdraw a previously offered interface
    Revoke = 3,
}

impl AnnounceKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AnnounceKind::Request),
            1 => Some(AnnounceKind::Acquire),
            2 => Some(AnnounceKind::Offer),
            3 => Some(AnnounceKind::Revoke),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub kind: AnnounceKind,
    /// Connection id handed to a spawned process, or 0
    pub exchange_id: u32,
    pub pid: u32,
    /// Interface the sender lends with this announce, if any
    pub implementation: InstanceId,
    pub interface: InterfaceId,
    pub version: u32,
    pub class_name: String,
    pub callsign: String,
}

impl AnnounceRequest {
    pub fn new(kind: AnnounceKind) -> Self {
        Self {
            kind,
            exchange_id: 0,
            pid: std::process::id(),
            implementation: InstanceId::NULL,
            interface: 0,
            version: 0,
            class_name: String::new(),
            callsign: String::new(),
        }
    }

    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        frame
            .push_number(self.kind as u8)
            .push_number(self.exchange_id)
            .push_number(self.pid)
            .push_number(self.implementation.as_raw())
            .push_number(self.interface)
            .push_number(self.version)
            .push_text(&self.class_name)?
            .push_text(&self.callsign)?;
        Ok(())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut reader = frame.reader();
        let raw_kind: u8 = reader.number()?;
        let kind = AnnounceKind::from_u8(raw_kind)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown announce kind {}", raw_kind)))?;

        Ok(Self {
            kind,
            exchange_id: reader.number()?,
            pid: reader.number()?,
            implementation: InstanceId::from_raw(reader.number()?),
            interface: reader.number()?,
            version: reader.number()?,
            class_name: reader.text()?,
            callsign: reader.text()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    pub result: ErrorCode,
    /// Interface the responder lends back, if any
    pub implementation: InstanceId,
    pub interface: InterfaceId,
    pub proxy_stub_path: String,
}

impl AnnounceResponse {
    pub fn failure(result: ErrorCode) -> Self {
        Self {
            result,
            implementation: InstanceId::NULL,
            interface: 0,
            proxy_stub_path: String::new(),
        }
    }

    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        frame
            .push_number(self.result.as_u32())
            .push_number(self.implementation.as_raw())
            .push_number(self.interface)
            .push_text(&self.proxy_stub_path)?;
        Ok(())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut reader = frame.reader();
        Ok(Self {
            result: ErrorCode::from_u32(reader.number()?),
            implementation: InstanceId::from_raw(reader.number()?),
            interface: reader.number()?,
            proxy_stub_path: reader.text()?,
        })
    }
}
