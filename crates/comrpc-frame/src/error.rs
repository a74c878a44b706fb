//! Frame error types

use thiserror::Error;

/// Frame access errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Read past the end of the frame
    #[error("frame underflow at offset {offset}: needed {needed} bytes, have {have}")]
    Underflow {
        offset: usize,
        needed: usize,
        have: usize,
    },

    /// Text longer than its length prefix can describe
    #[error("text too long: {len} bytes (max {max})")]
    TextTooLong { len: usize, max: usize },

    /// Buffer longer than its length prefix can describe
    #[error("buffer too long: {len} bytes (max {max})")]
    BufferTooLong { len: usize, max: usize },

    /// Invalid boolean encoding
    #[error("invalid boolean value: {0}")]
    InvalidBool(u8),

    /// UTF-8 decoding error
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Result type for frame operations
pub type Result<T> = std::result::Result<T, FrameError>;
