//! Little-endian cursor and builder over raw byte buffers.
//!
//! Every offset/length computation goes through checked arithmetic before a
//! byte is touched, so a crafted length field can never wrap an index back
//! into range.

use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufError {
    #[error("buffer underflow: need {needed} bytes at offset {offset}, {available} available")]
    Underflow {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("range {offset}+{len} escapes buffer of {limit} bytes")]
    OutOfBounds { offset: u64, len: u64, limit: usize },
}

pub type Result<T, E = BufError> = core::result::Result<T, E>;

/// Resolves `offset..offset + len` against a buffer of `limit` bytes.
pub fn checked_range(offset: u32, len: u32, limit: usize) -> Result<Range<usize>> {
    let out_of_bounds = BufError::OutOfBounds {
        offset: offset.into(),
        len: len.into(),
        limit,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds)?;
    let len = usize::try_from(len).map_err(|_| out_of_bounds)?;
    let end = start.checked_add(len).ok_or(out_of_bounds)?;
    if end > limit {
        return Err(out_of_bounds);
    }
    Ok(start..end)
}

/// Forward-only reader used by the blob and archive parsers
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Unread part of the buffer, starting at the cursor.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let underflow = BufError::Underflow {
            offset: self.pos,
            needed: len,
            available: self.remaining(),
        };
        let end = self.pos.checked_add(len).ok_or(underflow)?;
        if end > self.data.len() {
            return Err(underflow);
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Append-only builder for the serializers
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}
