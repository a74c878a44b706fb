//! Invoke messages
//!
//! Request: `u64 instance | u32 interface | u16 method | buffer params`
//!
//! Response: `u32 result | buffer frame | u16 count | count × (u64 instance, u32 interface)`
//!
//! The response tail piggybacks reference changes on interfaces the
//! caller passed in. An interface id with [`RELEASE_DIRECTION`] set is a
//! Release, otherwise an AddRef.

use crate::types::{ErrorCode, InstanceId, InterfaceId, MethodIndex, Result, RELEASE_DIRECTION};
use comrpc_frame::Frame;

/// Call on one method of a remote instance
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub instance: InstanceId,
    pub interface: InterfaceId,
    pub method: MethodIndex,
    pub params: Frame,
}

impl InvokeRequest {
    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        frame
            .push_number(self.instance.as_raw())
            .push_number(self.interface)
            .push_number(self.method)
            .push_buffer(self.params.as_bytes())?;
        Ok(())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut reader = frame.reader();
        Ok(Self {
            instance: InstanceId::from_raw(reader.number()?),
            interface: reader.number()?,
            method: reader.number()?,
            params: Frame::from(reader.buffer()?),
        })
    }
}

/// One piggybacked reference change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TailEntry {
    pub instance: InstanceId,
    pub interface: InterfaceId,
    pub release: bool,
}

impl TailEntry {
    pub fn add_ref(instance: InstanceId, interface: InterfaceId) -> Self {
        Self {
            instance,
            interface,
            release: false,
        }
    }

    pub fn release(instance: InstanceId, interface: InterfaceId) -> Self {
        Self {
            instance,
            interface,
            release: true,
        }
    }

    fn wire_interface(&self) -> u32 {
        if self.release {
            self.interface | RELEASE_DIRECTION
        } else {
            self.interface
        }
    }
}

/// Reply to an [`InvokeRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponse {
    pub result: ErrorCode,
    pub frame: Frame,
    pub tail: Vec<TailEntry>,
}

impl InvokeResponse {
    /// Response carrying only a result code
    pub fn status(result: ErrorCode) -> Self {
        Self {
            result,
            frame: Frame::new(),
            tail: Vec::new(),
        }
    }

    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        let count = u16::try_from(self.tail.len()).map_err(|_| {
            crate::types::Error::InvalidMessage(format!("tail too long: {}", self.tail.len()))
        })?;

        frame
            .push_number(self.result.as_u32())
            .push_buffer(self.frame.as_bytes())?
            .push_number(count);
        for entry in &self.tail {
            frame
                .push_number(entry.instance.as_raw())
                .push_number(entry.wire_interface());
        }
        Ok(())
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut reader = frame.reader();
        let result = ErrorCode::from_u32(reader.number()?);
        let body = Frame::from(reader.buffer()?);
        let count: u16 = reader.number()?;

        let mut tail = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let instance = InstanceId::from_raw(reader.number()?);
            let wire: u32 = reader.number()?;
            tail.push(TailEntry {
                instance,
                interface: wire & !RELEASE_DIRECTION,
                release: wire & RELEASE_DIRECTION != 0,
            });
        }

        Ok(Self {
            result,
            frame: body,
            tail,
        })
    }
}
