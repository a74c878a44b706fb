//! COM-RPC error types

use super::ids::{ChannelId, InstanceId, InterfaceId, MethodIndex};
use comrpc_frame::FrameError;
use std::fmt;
use thiserror::Error;

/// Result type for COM-RPC operations
pub type Result<T> = std::result::Result<T, Error>;

/// COM-RPC errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame contents
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A wait for a reply or an announce expired
    #[error("operation timed out")]
    Timeout,

    /// The channel went away before the operation completed
    #[error("channel {0} closed")]
    ChannelClosed(ChannelId),

    /// Peer or process is not available
    #[error("peer unavailable")]
    Unavailable,

    /// The channel already completed its announce handshake
    #[error("already connected")]
    AlreadyConnected,

    /// No stub or proxy factory registered for the interface
    #[error("unknown interface: {0:#010x}")]
    UnknownInterface(InterfaceId),

    /// Instance handle does not resolve to a live object
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    /// Method index outside the interface's table
    #[error("unknown method {method} on interface {interface:#010x}")]
    UnknownMethod {
        interface: InterfaceId,
        method: MethodIndex,
    },

    /// Message failed validation
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Message exceeds the configured maximum
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The peer answered with a failure code
    #[error("remote call failed: {0}")]
    Remote(ErrorCode),

    /// Process could not be started
    #[error("process launch failed: {0}")]
    Launch(String),

    /// Endpoint string could not be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl Error {
    /// Wire code reported to a peer for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Timeout => ErrorCode::Timeout,
            Error::ChannelClosed(_) => ErrorCode::ChannelClosed,
            Error::Unavailable | Error::Launch(_) => ErrorCode::Unavailable,
            Error::AlreadyConnected => ErrorCode::AlreadyConnected,
            Error::UnknownInterface(_)
            | Error::UnknownInstance(_)
            | Error::UnknownMethod { .. } => ErrorCode::UnknownKey,
            Error::Frame(_) | Error::InvalidMessage(_) | Error::MessageTooLarge { .. } => {
                ErrorCode::BadRequest
            }
            Error::Remote(code) => *code,
            Error::Io(_) | Error::InvalidEndpoint(_) => ErrorCode::General,
        }
    }
}

/// Result codes carried on the wire
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    None = 0,
    General = 1,
    Timeout = 2,
    Unavailable = 3,
    AlreadyConnected = 4,
    UnknownKey = 5,
    BadRequest = 6,
    ChannelClosed = 7,
    /// Sentinel: this Release destroyed the object
    DestructionSucceeded = 8,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ErrorCode::None,
            2 => ErrorCode::Timeout,
            3 => ErrorCode::Unavailable,
            4 => ErrorCode::AlreadyConnected,
            5 => ErrorCode::UnknownKey,
            6 => ErrorCode::BadRequest,
            7 => ErrorCode::ChannelClosed,
            8 => ErrorCode::DestructionSucceeded,
            _ => ErrorCode::General,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Both `None` and `DestructionSucceeded` mean the operation worked
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::None | ErrorCode::DestructionSucceeded)
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Remote(self))
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::None => "none",
            ErrorCode::General => "general failure",
            ErrorCode::Timeout => "timed out",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::AlreadyConnected => "already connected",
            ErrorCode::UnknownKey => "unknown key",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::ChannelClosed => "channel closed",
            ErrorCode::DestructionSucceeded => "destruction succeeded",
        };
        write!(f, "{} ({})", name, self.as_u32())
    }
}
