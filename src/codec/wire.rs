//! Little-endian, length-prefixed primitives shared by the snapshot codec.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid utf-8 string")]
    InvalidUtf8,

    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("string of {0} bytes exceeds limit")]
    StringTooLong(usize),
}

#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes `u32` length followed by UTF-8 bytes. Fails if the string is longer than `limit`.
    pub fn put_str(&mut self, value: &str, limit: usize) -> Result<(), WireError> {
        let bytes = value.as_bytes();
        if bytes.len() > limit || bytes.len() > u32::MAX as usize {
            return Err(WireError::StringTooLong(bytes.len()));
        }
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes `u32` byte length followed by the frame body.
    pub fn put_frame(&mut self, body: &[u8]) {
        self.put_u32(body.len() as u32);
        self.buf.extend_from_slice(body);
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array::<8>()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take_array::<8>()?))
    }

    /// Reads the raw bytes of a length-prefixed string without validating them.
    ///
    /// Alignment is preserved even when the payload later turns out to be invalid UTF-8.
    pub fn get_str_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_str(&mut self) -> Result<String, WireError> {
        let bytes = self.get_str_bytes()?;
        utf8(bytes)
    }

    pub fn get_frame(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }
}

pub fn utf8(bytes: &[u8]) -> Result<String, WireError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| WireError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_are_little_endian() {
        let mut writer = WireWriter::new();
        writer.put_u32(1);
        writer.put_i64(-2);
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.get_u32().unwrap(), 1);
        assert_eq!(reader.get_i64().unwrap(), -2);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_truncated_read_reports_sizes() {
        let mut reader = WireReader::new(&[1, 2]);
        assert_eq!(
            reader.get_u32(),
            Err(WireError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_string_limit_enforced() {
        let mut writer = WireWriter::new();
        assert_eq!(writer.put_str("abcdef", 3), Err(WireError::StringTooLong(6)));
        assert!(writer.is_empty());
    }

    #[test]
    fn test_invalid_utf8_keeps_alignment() {
        let mut writer = WireWriter::new();
        writer.put_u32(2);
        writer.put_raw(&[0xff, 0xfe]);
        writer.put_str("ok", 16).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.get_str(), Err(WireError::InvalidUtf8));
        assert_eq!(reader.get_str().unwrap(), "ok");
    }

    #[test]
    fn test_invalid_bool() {
        let mut reader = WireReader::new(&[7]);
        assert_eq!(reader.get_bool(), Err(WireError::InvalidBool(7)));
    }
}
