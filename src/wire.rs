//! Little-endian wire encoding for control messages and file headers.
//!
//! Conventions:
//! - All multi-byte integers are little-endian fixed width.
//! - Variable-length buffers are prefixed by a `u32` length.
//! - Optional fields are prefixed by a one-byte presence flag.
//!
//! The same canonical argument order is used by the async dispatch layer
//! on both sides of the channel, so a reader that consumes fields in the
//! order the writer produced them reconstructs the call exactly.

use crate::error::{PioError, Result};

/// Append-only encoder.
#[derive(Default)]
pub(crate) struct MsgWriter {
    buf: Vec<u8>,
}

impl MsgWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_u64s(&mut self, v: &[u64]) {
        self.put_u32(v.len() as u32);
        for &x in v {
            self.buf.extend_from_slice(&x.to_le_bytes());
        }
    }

    pub fn put_usizes(&mut self, v: &[usize]) {
        self.put_u32(v.len() as u32);
        for &x in v {
            self.buf.extend_from_slice(&(x as u64).to_le_bytes());
        }
    }

    pub fn put_opt_bytes(&mut self, v: Option<&[u8]>) {
        match v {
            Some(b) => {
                self.put_bool(true);
                self.put_bytes(b);
            }
            None => self.put_bool(false),
        }
    }

    pub fn put_opt_usizes(&mut self, v: Option<&[usize]>) {
        match v {
            Some(b) => {
                self.put_bool(true);
                self.put_usizes(b);
            }
            None => self.put_bool(false),
        }
    }
}

/// Cursor-style decoder; every accessor fails with a protocol error on a
/// truncated or malformed buffer rather than panicking.
pub(crate) struct MsgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MsgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(PioError::Protocol(format!(
                "message truncated: wanted {n} bytes at offset {} of {}",
                self.pos,
                self.buf.len()
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    pub fn str(&mut self) -> Result<String> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec())
            .map_err(|_| PioError::Protocol("non-UTF8 string on wire".into()))
    }

    pub fn u64s(&mut self) -> Result<Vec<u64>> {
        let n = self.u32()? as usize;
        let raw = self.take(n * 8)?;
        Ok(raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    pub fn usizes(&mut self) -> Result<Vec<usize>> {
        Ok(self.u64s()?.into_iter().map(|x| x as usize).collect())
    }

    pub fn opt_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        if self.bool()? {
            Ok(Some(self.bytes()?))
        } else {
            Ok(None)
        }
    }

    pub fn opt_usizes(&mut self) -> Result<Option<Vec<usize>>> {
        if self.bool()? {
            Ok(Some(self.usizes()?))
        } else {
            Ok(None)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_field_kinds() {
        let mut w = MsgWriter::new();
        w.put_i32(-7);
        w.put_u64(1 << 40);
        w.put_str("hello");
        w.put_u64s(&[3, 1, 4, 1, 5]);
        w.put_opt_bytes(None);
        w.put_opt_bytes(Some(&[9, 9]));
        w.put_opt_usizes(Some(&[2, 4]));
        let buf = w.finish();

        let mut r = MsgReader::new(&buf);
        assert_eq!(r.i32().unwrap(), -7);
        assert_eq!(r.u64().unwrap(), 1 << 40);
        assert_eq!(r.str().unwrap(), "hello");
        assert_eq!(r.u64s().unwrap(), vec![3, 1, 4, 1, 5]);
        assert_eq!(r.opt_bytes().unwrap(), None);
        assert_eq!(r.opt_bytes().unwrap(), Some(&[9u8, 9][..]));
        assert_eq!(r.opt_usizes().unwrap(), Some(vec![2, 4]));
    }

    #[test]
    fn truncation_is_an_error() {
        let mut w = MsgWriter::new();
        w.put_u64(42);
        let buf = w.finish();
        let mut r = MsgReader::new(&buf[..5]);
        assert!(matches!(r.u64(), Err(PioError::Protocol(_))));
    }
}
