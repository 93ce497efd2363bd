//! Bounds-checked little-endian reader over a byte slice.
//!
//! Every decoder parses packet bodies through a [`ByteCursor`]. A short read
//! is always reported as [`CursorError::OutOfBounds`]; the cursor never pads,
//! wraps or silently truncates.

use thiserror::Error;

/// Failure to read from a [`ByteCursor`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("read of {requested} bytes at position {position} exceeds the {remaining} remaining")]
    OutOfBounds { requested: usize, remaining: usize, position: usize },
}

/// Sequential reader over a borrowed byte span.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Current read position from the start of the span.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Return the next `n` bytes and advance past them.
    pub fn read(&mut self, n: usize) -> Result<&'a [u8], CursorError> {
        let bytes = self.slice_ahead(n)?;
        self.position += n;
        Ok(bytes)
    }

    /// Read a fixed-size header without advancing.
    pub fn peek_header<const N: usize>(&self) -> Result<[u8; N], CursorError> {
        let bytes = self.slice_ahead(N)?;
        let mut header = [0u8; N];
        header.copy_from_slice(bytes);
        Ok(header)
    }

    /// Read a fixed-size array and advance past it.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
        let header = self.peek_header::<N>()?;
        self.position += N;
        Ok(header)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CursorError> {
        self.read(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CursorError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CursorError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, CursorError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, CursorError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read `count` little-endian u16 samples into `out`.
    ///
    /// The whole span is checked before anything is appended.
    pub fn read_u16_samples(&mut self, count: usize, out: &mut Vec<u16>) -> Result<(), CursorError> {
        let byte_len = count.checked_mul(2).ok_or(CursorError::OutOfBounds {
            requested: usize::MAX,
            remaining: self.remaining(),
            position: self.position,
        })?;
        let bytes = self.read(byte_len)?;
        out.reserve(count);
        out.extend(bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])));
        Ok(())
    }

    fn slice_ahead(&self, n: usize) -> Result<&'a [u8], CursorError> {
        let end = self.position.checked_add(n).filter(|end| *end <= self.data.len()).ok_or(
            CursorError::OutOfBounds {
                requested: n,
                remaining: self.remaining(),
                position: self.position,
            },
        )?;
        Ok(&self.data[self.position..end])
    }
}
