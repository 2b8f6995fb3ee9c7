//! Bounded cursor over a definitions stream.
//!
//! All multi-byte integers on the wire are little-endian. Strings and
//! register values are borrowed straight out of the input buffer, so the
//! cursor never copies payload data. Any under-read fails the whole pop;
//! no partial values are handed out.

use crate::error::{self, ErrorKind};
use crate::regval::RegValue;

pub struct Stream<'a> {
    buf: &'a [u8],
}

impl<'a> Stream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Number of bytes not consumed yet
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed tail of the input buffer
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn take(&mut self, len: usize) -> error::Result<&'a [u8]> {
        if self.buf.len() < len {
            Err(ErrorKind::Eof)?
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn pop_u8(&mut self) -> error::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn pop_u16(&mut self) -> error::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn pop_u32(&mut self) -> error::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Pop an unsigned integer whose wire size depends on `order`, the
    /// number of bits the value may need: up to 8 -> u8, up to 16 -> u16,
    /// up to 32 -> u32. Larger orders mark corrupt definitions.
    pub fn pop_uint_var(&mut self, order: u32) -> error::Result<u32> {
        if order <= 8 {
            Ok(u32::from(self.pop_u8()?))
        } else if order <= 16 {
            Ok(u32::from(self.pop_u16()?))
        } else if order <= 32 {
            self.pop_u32()
        } else {
            panic!("variable integer order {} out of range", order);
        }
    }

    /// Borrow `len` raw bytes and advance the cursor
    pub fn pop_bytes(&mut self, len: usize) -> error::Result<&'a [u8]> {
        self.take(len)
    }

    /// Pop a string: u16 length followed by that many UTF-8 bytes. The
    /// returned slice borrows from the input buffer.
    pub fn pop_str(&mut self) -> error::Result<&'a str> {
        let len = usize::from(self.pop_u16()?);
        let data = self.take(len)?;
        std::str::from_utf8(data)
            .map_err(|e| ErrorKind::Defs(format!("string is not valid UTF-8: {}", e)).into())
    }

    /// Pop a register value of `width` bits: the wire carries exactly
    /// `width / 8` bytes, least-significant byte first, which is also the
    /// in-memory layout of [`RegValue`] - no byte reversal happens here.
    pub fn pop_reg(&mut self, width: usize) -> error::Result<RegValue> {
        let data = self.take((width + 7) / 8)?;
        Ok(RegValue::from_le_bytes(width, data))
    }
}
