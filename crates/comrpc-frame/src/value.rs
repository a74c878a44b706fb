//! Values that know how to append themselves to a frame

use crate::{Frame, FrameReader, Result};
use bytes::Bytes;

/// A type with a frame encoding
///
/// Generated proxy/stub code and generic interfaces use this to move
/// parameters of any supported type through a [`Frame`].
pub trait FrameValue: Sized {
    fn write_to(&self, frame: &mut Frame) -> Result<()>;

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self>;
}

macro_rules! impl_frame_value_number {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FrameValue for $ty {
                fn write_to(&self, frame: &mut Frame) -> Result<()> {
                    frame.push_number(*self);
                    Ok(())
                }

                fn read_from(reader: &mut FrameReader<'_>) -> Result<Self> {
                    reader.number::<$ty>()
                }
            }
        )*
    };
}

impl_frame_value_number!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64, bool);

impl FrameValue for String {
    fn write_to(&self, frame: &mut Frame) -> Result<()> {
        frame.push_text(self)?;
        Ok(())
    }

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self> {
        reader.text()
    }
}

impl FrameValue for Bytes {
    fn write_to(&self, frame: &mut Frame) -> Result<()> {
        frame.push_buffer(self)?;
        Ok(())
    }

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self> {
        reader.buffer()
    }
}

// Option<T> is a presence byte followed by the value
impl<T: FrameValue> FrameValue for Option<T> {
    fn write_to(&self, frame: &mut Frame) -> Result<()> {
        match self {
            Some(value) => {
                frame.push_number(true);
                value.write_to(frame)
            }
            None => {
                frame.push_number(false);
                Ok(())
            }
        }
    }

    fn read_from(reader: &mut FrameReader<'_>) -> Result<Self> {
        if reader.number::<bool>()? {
            Ok(Some(T::read_from(reader)?))
        } else {
            Ok(None)
        }
    }
}
