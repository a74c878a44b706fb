//! Fixed-width number encodings
//!
//! | Rust Type | Size |
//! |-----------|------|
//! | u8 / i8   | 1    |
//! | u16 / i16 | 2    |
//! | u32 / i32 | 4    |
//! | u64 / i64 | 8    |
//! | f32       | 4    |
//! | f64       | 8    |
//! | bool      | 1    |

use crate::{FrameError, Result};

/// A value with a fixed-width little-endian encoding
pub trait Number: Copy + Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write the value into `dst`, which is exactly `SIZE` bytes long
    fn write_le(self, dst: &mut [u8]);

    /// Read the value from `src`, which is exactly `SIZE` bytes long
    fn read_le(src: &[u8]) -> Result<Self>;
}

// Macro to implement Number for the primitive integer and float types
macro_rules! impl_number {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Number for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_le(self, dst: &mut [u8]) {
                    dst.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(src: &[u8]) -> Result<Self> {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(src);
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_number!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Number for bool {
    const SIZE: usize = 1;

    fn write_le(self, dst: &mut [u8]) {
        dst[0] = self as u8;
    }

    fn read_le(src: &[u8]) -> Result<Self> {
        match src[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FrameError::InvalidBool(other)),
        }
    }
}
