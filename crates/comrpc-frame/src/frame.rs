//! Frame buffer and sequential reader

use crate::number::Number;
use crate::value::FrameValue;
use crate::{FrameError, Result, BUFFER_PREFIX_SIZE, TEXT_PREFIX_SIZE};
use bytes::{Bytes, BytesMut};

/// Growable byte buffer with typed get/set at absolute offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    data: BytesMut,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Convert into immutable bytes without copying
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Grow the frame so `[offset, offset + size)` exists and return that range
    fn reserve_range(&mut self, offset: usize, size: usize) -> &mut [u8] {
        let end = offset + size;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        &mut self.data[offset..end]
    }

    fn range(&self, offset: usize, size: usize) -> Result<&[u8]> {
        let have = self.data.len().saturating_sub(offset);
        if have < size {
            return Err(FrameError::Underflow {
                offset,
                needed: size,
                have,
            });
        }
        Ok(&self.data[offset..offset + size])
    }

    /// Write a number at `offset`, returning the number of bytes written
    pub fn set_number<T: Number>(&mut self, offset: usize, value: T) -> usize {
        value.write_le(self.reserve_range(offset, T::SIZE));
        T::SIZE
    }

    pub fn get_number<T: Number>(&self, offset: usize) -> Result<T> {
        T::read_le(self.range(offset, T::SIZE)?)
    }

    /// Write length-prefixed text at `offset`, returning the number of bytes written
    pub fn set_text(&mut self, offset: usize, text: &str) -> Result<usize> {
        let len = text.len();
        if len > u16::MAX as usize {
            return Err(FrameError::TextTooLong {
                len,
                max: u16::MAX as usize,
            });
        }
        self.set_number(offset, len as u16);
        self.reserve_range(offset + TEXT_PREFIX_SIZE, len)
            .copy_from_slice(text.as_bytes());
        Ok(TEXT_PREFIX_SIZE + len)
    }

    pub fn get_text(&self, offset: usize) -> Result<String> {
        let len = self.get_number::<u16>(offset)? as usize;
        let raw = self.range(offset + TEXT_PREFIX_SIZE, len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    /// Write a length-prefixed byte buffer at `offset`, returning the number of bytes written
    pub fn set_buffer(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        let len = data.len();
        if len > u32::MAX as usize {
            return Err(FrameError::BufferTooLong {
                len,
                max: u32::MAX as usize,
            });
        }
        self.set_number(offset, len as u32);
        self.reserve_range(offset + BUFFER_PREFIX_SIZE, len)
            .copy_from_slice(data);
        Ok(BUFFER_PREFIX_SIZE + len)
    }

    pub fn get_buffer(&self, offset: usize) -> Result<Bytes> {
        let len = self.get_number::<u32>(offset)? as usize;
        let raw = self.range(offset + BUFFER_PREFIX_SIZE, len)?;
        Ok(Bytes::copy_from_slice(raw))
    }

    /// Append a number at the end of the frame
    pub fn push_number<T: Number>(&mut self, value: T) -> &mut Self {
        let end = self.len();
        self.set_number(end, value);
        self
    }

    pub fn push_text(&mut self, text: &str) -> Result<&mut Self> {
        let end = self.len();
        self.set_text(end, text)?;
        Ok(self)
    }

    pub fn push_buffer(&mut self, data: &[u8]) -> Result<&mut Self> {
        let end = self.len();
        self.set_buffer(end, data)?;
        Ok(self)
    }

    /// Append any [`FrameValue`]
    pub fn push<V: FrameValue>(&mut self, value: &V) -> Result<&mut Self> {
        value.write_to(self)?;
        Ok(self)
    }

    /// Sequential reader starting at offset 0
    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader {
            frame: self,
            offset: 0,
        }
    }
}

impl From<Bytes> for Frame {
    fn from(data: Bytes) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
        }
    }
}

impl From<&[u8]> for Frame {
    fn from(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
        }
    }
}

impl From<BytesMut> for Frame {
    fn from(data: BytesMut) -> Self {
        Self { data }
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Cursor over a [`Frame`] that tracks the read offset
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    frame: &'a Frame,
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.frame.len().saturating_sub(self.offset)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn number<T: Number>(&mut self) -> Result<T> {
        let value = self.frame.get_number(self.offset)?;
        self.offset += T::SIZE;
        Ok(value)
    }

    pub fn text(&mut self) -> Result<String> {
        let value = self.frame.get_text(self.offset)?;
        self.offset += TEXT_PREFIX_SIZE + value.len();
        Ok(value)
    }

    pub fn buffer(&mut self) -> Result<Bytes> {
        let value = self.frame.get_buffer(self.offset)?;
        self.offset += BUFFER_PREFIX_SIZE + value.len();
        Ok(value)
    }

    pub fn read<V: FrameValue>(&mut self) -> Result<V> {
        V::read_from(self)
    }
}
