//! Byte-cursor packet codec
//!
//! `PacketWriter` appends fields to a growable buffer, `PacketReader` walks a
//! received frame. All multi-byte integers are little-endian, strings are
//! NUL-terminated and variable-length integers carry 7 data bits per byte
//! (low bits first, high bit set on every byte except the last).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while reading a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of packet: needed {needed} bytes, {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("String is missing its NUL terminator")]
    MissingTerminator,
    #[error("String is not valid UTF-8")]
    InvalidUtf8,
    #[error("Variable-length integer does not fit in 64 bits")]
    VarIntOverflow,
}

/// Append-only packet builder
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_u128(&mut self, value: u128) {
        self.buf.put_u128_le(value);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Write a NUL-terminated string. Anything after an embedded NUL is
    /// unreadable on the other side.
    pub fn write_str(&mut self, value: &str) {
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    /// Write a variable-length integer. Values in `0..128` take one byte,
    /// negative values always take ten.
    pub fn write_var_int(&mut self, value: i64) {
        let mut rest = value as u64;
        loop {
            let byte = (rest & 0x7f) as u8;
            rest >>= 7;
            if rest == 0 {
                self.buf.put_u8(byte);
                break;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the packet
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Read cursor over a received frame
#[derive(Debug, Clone)]
pub struct PacketReader {
    data: Bytes,
    pos: usize,
}

impl PacketReader {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read offset from the start of the frame
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_data_left(&self) -> bool {
        self.remaining() > 0
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], CodecError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(CodecError::UnexpectedEnd { needed, remaining });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&self.data[start..self.pos])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u128(&mut self) -> Result<u128, CodecError> {
        Ok(u128::from_le_bytes(self.read_array()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, CodecError> {
        let start = self.pos;
        self.take(len)?;
        Ok(self.data.slice(start..self.pos))
    }

    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(CodecError::MissingTerminator)?;
        let value = std::str::from_utf8(&rest[..end])
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_owned();
        self.pos += end + 1;
        Ok(value)
    }

    pub fn read_var_int(&mut self) -> Result<i64, CodecError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && bits > 1) {
                return Err(CodecError::VarIntOverflow);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(value as i64)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        self.take(len).map(|_| ())
    }

    /// Everything not yet read
    pub fn rest(&self) -> Bytes {
        self.data.slice(self.pos..)
    }

    /// The frame from `start` to its end, regardless of the cursor
    pub fn slice_from(&self, start: usize) -> Bytes {
        self.data.slice(start.min(self.data.len())..)
    }
}
