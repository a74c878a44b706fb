//! Frame buffer for COM-RPC messages
//!
//! A [`Frame`] is a growable byte buffer with typed, offset-based access.
//! Message codecs and proxy/stub code use it to lay out parameters on the
//! wire without an intermediate serialization model.
//!
//! # Wire Format
//!
//! | Item    | Encoding                                  |
//! |---------|-------------------------------------------|
//! | numbers | fixed width, little-endian                |
//! | bool    | one byte, `0` or `1`                      |
//! | text    | `u16` byte length followed by UTF-8 bytes |
//! | buffer  | `u32` byte length followed by raw bytes   |
//!
//! Offsets are absolute. Writing past the current end grows the frame and
//! zero-fills any gap; reading past the end is an error.

mod error;
mod frame;
mod number;
mod value;

pub use error::{FrameError, Result};
pub use frame::{Frame, FrameReader};
pub use number::Number;
pub use value::FrameValue;

/// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

/// Size of the length prefix in front of text
pub const TEXT_PREFIX_SIZE: usize = 2;

/// Size of the length prefix in front of a buffer
pub const BUFFER_PREFIX_SIZE: usize = 4;
