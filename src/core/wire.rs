//! Primitive wire readers and writers.
//!
//! All integers are big-endian and fixed-width; all variable-length fields
//! are 4-byte length-prefixed with no terminator. Length fields are validated
//! against fixed maxima *before* any allocation so that malformed or hostile
//! input is rejected cheaply.

use bytes::{Buf, BufMut};

use crate::error::{HandleError, Result};

/// Longest accepted handle, in bytes.
pub const MAX_HANDLE_LENGTH: usize = 2048;
/// Longest accepted opaque byte field (value data, keys, error text).
pub const MAX_DATA_LENGTH: usize = 16 * 1024 * 1024;
/// Most elements accepted in any counted array.
pub const MAX_ARRAY_SIZE: usize = 16_384;

/// Cursor over a received buffer with bounds-checked reads.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, bytes: usize) -> Result<()> {
        if self.buf.len() < bytes {
            return Err(HandleError::Truncated {
                needed: bytes,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a 4-byte length followed by that many raw bytes, bounded by
    /// `limit`.
    pub fn read_bytes_bounded(&mut self, limit: usize) -> Result<Vec<u8>> {
        let length = self.read_u32()? as usize;
        if length > limit {
            return Err(HandleError::FieldTooLong { length, limit });
        }
        self.need(length)?;
        let mut out = vec![0u8; length];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Length-prefixed byte string with the general data limit.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.read_bytes_bounded(MAX_DATA_LENGTH)
    }

    /// Length-prefixed handle string, validated as UTF-8.
    pub fn read_handle(&mut self) -> Result<String> {
        let raw = self.read_bytes_bounded(MAX_HANDLE_LENGTH)?;
        String::from_utf8(raw)
            .map_err(|_| HandleError::Protocol("handle is not valid UTF-8".into()))
    }

    /// A 4-byte element count, validated against `MAX_ARRAY_SIZE` and against
    /// the bytes actually remaining (each element needs at least
    /// `min_element_size` bytes) before the caller allocates.
    pub fn read_array_len(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count > MAX_ARRAY_SIZE {
            return Err(HandleError::FieldTooLong {
                length: count,
                limit: MAX_ARRAY_SIZE,
            });
        }
        let floor = count.saturating_mul(min_element_size.max(1));
        if floor > self.buf.len() {
            return Err(HandleError::Truncated {
                needed: floor,
                remaining: self.buf.len(),
            });
        }
        Ok(count)
    }

    /// List of u32 values (4-byte count + 4-byte elements).
    pub fn read_u32_array(&mut self) -> Result<Vec<u32>> {
        let count = self.read_array_len(4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_u32()?);
        }
        Ok(out)
    }

    /// List of byte strings (4-byte count + length-prefixed elements).
    pub fn read_bytes_array(&mut self, element_limit: usize) -> Result<Vec<Vec<u8>>> {
        let count = self.read_array_len(4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_bytes_bounded(element_limit)?);
        }
        Ok(out)
    }
}

/// Write a length-prefixed byte string.
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Write a handle as a length-prefixed UTF-8 string.
pub fn put_handle(buf: &mut impl BufMut, handle: &str) {
    put_bytes(buf, handle.as_bytes());
}

/// Write a list of u32 values.
pub fn put_u32_array(buf: &mut impl BufMut, values: &[u32]) {
    buf.put_u32(values.len() as u32);
    for v in values {
        buf.put_u32(*v);
    }
}

/// Write a list of byte strings.
pub fn put_bytes_array(buf: &mut impl BufMut, values: &[Vec<u8>]) {
    buf.put_u32(values.len() as u32);
    for v in values {
        put_bytes(buf, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_primitives() {
        let mut buf = Vec::new();
        buf.put_u16(0x1234);
        buf.put_u32(0xDEAD_BEEF);
        put_bytes(&mut buf, b"payload");
        put_u32_array(&mut buf, &[1, 2, 3]);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_bytes().unwrap(), b"payload");
        assert_eq!(reader.read_u32_array().unwrap(), vec![1, 2, 3]);
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_read_fails_fast() {
        let mut buf = Vec::new();
        buf.put_u32(100); // claims 100 bytes
        buf.put_slice(&[1, 2, 3]);
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.read_bytes(),
            Err(HandleError::Truncated { needed: 100, .. })
        ));
    }

    #[test]
    fn oversized_length_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.put_u32(u32::MAX);
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.read_bytes_bounded(1024),
            Err(HandleError::FieldTooLong { limit: 1024, .. })
        ));
    }

    #[test]
    fn hostile_array_count_rejected() {
        let mut buf = Vec::new();
        buf.put_u32(1_000_000); // one million claimed elements, no data
        let mut reader = Reader::new(&buf);
        assert!(reader.read_u32_array().is_err());
    }

    #[test]
    fn zero_length_fields_roundtrip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"");
        put_u32_array(&mut buf, &[]);
        let mut reader = Reader::new(&buf);
        assert!(reader.read_bytes().unwrap().is_empty());
        assert!(reader.read_u32_array().unwrap().is_empty());
    }
}
