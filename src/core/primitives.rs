//! # Primitive Codec
//!
//! Fixed-width little-endian integers, booleans, GUIDs, length-prefixed strings
//! and byte buffers. Everything above this module is built from these calls.
//!
//! ## Encodings
//! ```text
//! bool            1 byte, 0 = false, anything else reads as true
//! u16/u32/u64     little-endian
//! i32/i64         little-endian two's complement
//! Guid            16 raw bytes
//! String          7-bit encoded byte length, then UTF-8
//! Option<String>  is-null bool, then String when present
//! Option<bytes>   is-null bool, then i32 length and raw bytes when present
//! ```
//!
//! An empty buffer (`Some(vec![])`) is written with length 0 and is distinct
//! from `None`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{constants, ProtocolError, Result};

/// A 16-byte globally unique identifier, stored in wire order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid([u8; 16]);

impl Guid {
    /// The all-zero GUID.
    pub const EMPTY: Guid = Guid([0u8; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    /// Generate a random (version 4 layout) GUID.
    pub fn new_random() -> Self {
        let mut bytes: [u8; 16] = rand::random();
        bytes[7] = (bytes[7] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Guid(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Growable little-endian output buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
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

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_guid(&mut self, value: &Guid) {
        self.buf.put_slice(value.as_bytes());
    }

    /// Write a string with a 7-bit encoded byte-length prefix.
    pub fn write_string(&mut self, value: &str) {
        let mut len = value.len() as u64;
        while len >= 0x80 {
            self.buf.put_u8((len as u8) | 0x80);
            len >>= 7;
        }
        self.buf.put_u8(len as u8);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_nullable_string(&mut self, value: Option<&str>) {
        self.write_bool(value.is_none());
        if let Some(s) = value {
            self.write_string(s);
        }
    }

    /// Write an optional byte buffer: is-null flag, then i32 length and the bytes.
    ///
    /// Buffers whose length does not fit the i32 prefix are rejected before
    /// anything is written.
    pub fn write_bytes(&mut self, value: Option<&[u8]>) -> Result<()> {
        let len = value.map(|data| length_prefix(data.len())).transpose()?;
        self.write_bool(value.is_none());
        if let (Some(data), Some(len)) = (value, len) {
            self.write_i32(len);
            self.buf.put_slice(data);
        }
        Ok(())
    }

    /// Append raw bytes with no framing.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// The i32 length prefix of a byte buffer of `len` bytes.
pub fn length_prefix(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        ProtocolError::Format(format!("Byte buffer too large for an i32 length: {len}"))
    })
}

/// Cursor over a borrowed input buffer. Every read checks for underrun.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, consumed: 0 }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Bytes read so far.
    pub fn position(&self) -> usize {
        self.consumed
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Format(format!(
                "{} at offset {}: needed {needed} bytes, {} left",
                constants::ERR_BUFFER_UNDERRUN,
                self.consumed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        self.consumed += 2;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        self.consumed += 4;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_guid(&mut self) -> Result<Guid> {
        self.ensure(16)?;
        let mut bytes = [0u8; 16];
        self.buf.copy_to_slice(&mut bytes);
        self.consumed += 16;
        Ok(Guid::from_bytes(bytes))
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        self.consumed += len;
        Ok(head)
    }

    /// Read a 7-bit encoded length. At most five bytes are accepted.
    fn read_7bit_length(&mut self) -> Result<usize> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return usize::try_from(value)
                    .map_err(|_| ProtocolError::format(constants::ERR_BAD_STRING_LENGTH));
            }
        }
        Err(ProtocolError::format(constants::ERR_BAD_STRING_LENGTH))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_7bit_length()?;
        let raw = self.read_exact(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::format(constants::ERR_INVALID_UTF8))
    }

    pub fn read_nullable_string(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            return Ok(None);
        }
        self.read_string().map(Some)
    }

    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_bool()? {
            return Ok(None);
        }
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| {
            ProtocolError::Format(format!("{}: {len}", constants::ERR_NEGATIVE_LENGTH))
        })?;
        Ok(Some(self.read_exact(len)?.to_vec()))
    }

    /// Read an i32 element count, rejecting negative values.
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_i32()?;
        usize::try_from(count).map_err(|_| {
            ProtocolError::Format(format!("{}: {count}", constants::ERR_NEGATIVE_LENGTH))
        })
    }
}
