//! Wire messages
//!
//! Every message travels inside a fixed 12-byte header:
//!
//! ```text
//! ┌──────────────┬──────┬───────┬──────────┬──────────────┐
//! │ length (u32) │ kind │ flags │ reserved │ sequence u32 │
//! └──────────────┴──────┴───────┴──────────┴──────────────┘
//! ```
//!
//! `length` covers the header and body. `kind` selects Announce or Invoke,
//! the response flag distinguishes replies, and `sequence` correlates a
//! reply with its request. All fields are little-endian.

mod announce;
mod invoke;

pub use announce::{AnnounceKind, AnnounceRequest, AnnounceResponse};
pub use invoke::{InvokeRequest, InvokeResponse, TailEntry};

use crate::types::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use comrpc_frame::Frame;

/// Message header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Header flag marking a response
pub const FLAG_RESPONSE: u8 = 0x01;

/// Message kind
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Announce = 1,
    Invoke = 2,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Announce),
            2 => Some(MessageKind::Invoke),
            _ => None,
        }
    }
}

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: u32,
    pub kind: MessageKind,
    pub flags: u8,
    pub sequence: u32,
}

impl MessageHeader {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.length);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u16_le(0);
        buf.put_u32_le(self.sequence);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }

        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let kind = MessageKind::from_u8(data[4])
            .ok_or_else(|| Error::InvalidMessage(format!("unknown message kind {}", data[4])))?;
        let flags = data[5];
        let sequence = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

        if (length as usize) < HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "invalid message length: {} < header size",
                length
            )));
        }

        Ok(Self {
            length,
            kind,
            flags,
            sequence,
        })
    }
}

/// Message body
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AnnounceRequest(AnnounceRequest),
    AnnounceResponse(AnnounceResponse),
    InvokeRequest(InvokeRequest),
    InvokeResponse(InvokeResponse),
}

impl Message {
    fn kind(&self) -> MessageKind {
        match self {
            Message::AnnounceRequest(_) | Message::AnnounceResponse(_) => MessageKind::Announce,
            Message::InvokeRequest(_) | Message::InvokeResponse(_) => MessageKind::Invoke,
        }
    }

    fn is_response(&self) -> bool {
        matches!(
            self,
            Message::AnnounceResponse(_) | Message::InvokeResponse(_)
        )
    }
}

/// A message together with its correlation sequence
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sequence: u32,
    pub message: Message,
}

impl Envelope {
    pub fn new(sequence: u32, message: Message) -> Self {
        Self { sequence, message }
    }

    /// Encode header and body into one contiguous buffer
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = Frame::new();
        match &self.message {
            Message::AnnounceRequest(request) => request.encode(&mut body)?,
            Message::AnnounceResponse(response) => response.encode(&mut body)?,
            Message::InvokeRequest(request) => request.encode(&mut body)?,
            Message::InvokeResponse(response) => response.encode(&mut body)?,
        }

        let length = HEADER_SIZE + body.len();
        let header = MessageHeader {
            length: u32::try_from(length).map_err(|_| Error::MessageTooLarge {
                size: length,
                max: u32::MAX as usize,
            })?,
            kind: self.message.kind(),
            flags: if self.message.is_response() { FLAG_RESPONSE } else { 0 },
            sequence: self.sequence,
        };

        let mut buf = BytesMut::with_capacity(length);
        header.encode(&mut buf);
        buf.put_slice(body.as_bytes());
        Ok(buf.freeze())
    }

    /// Decode a complete message, header included
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = MessageHeader::decode(data)?;
        if header.length as usize != data.len() {
            return Err(Error::InvalidMessage(format!(
                "length mismatch: header says {}, got {}",
                header.length,
                data.len()
            )));
        }

        let body = Frame::from(&data[HEADER_SIZE..]);
        let message = match (header.kind, header.is_response()) {
            (MessageKind::Announce, false) => Message::AnnounceRequest(AnnounceRequest::decode(&body)?),
            (MessageKind::Announce, true) => Message::AnnounceResponse(AnnounceResponse::decode(&body)?),
            (MessageKind::Invoke, false) => Message::InvokeRequest(InvokeRequest::decode(&body)?),
            (MessageKind::Invoke, true) => Message::InvokeResponse(InvokeResponse::decode(&body)?),
        };

        Ok(Self {
            sequence: header.sequence,
            message,
        })
    }
}
