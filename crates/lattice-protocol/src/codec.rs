//! Canonical byte encoding shared by every signed envelope.
//!
//! Layout rules:
//! - every envelope starts with a length-prefixed domain tag
//! - integers are big-endian
//! - strings and byte strings are prefixed with a u32 length
//! - fixed-size fields (ids, nonces, signatures) are written raw
//!
//! Decoding is strict. Callers re-encode what they decoded and compare, so
//! two different byte strings can never decode to the same envelope.

use crate::error::{Error, Result};

/// Upper bound for any single length-prefixed field.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Builder for canonical envelope bytes.
#[derive(Debug)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Start an envelope under the given domain tag.
    pub fn new(domain: &str) -> Self {
        let mut encoder = Self {
            buf: Vec::with_capacity(256),
        };
        encoder.put_str(domain);
        encoder
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write raw bytes with no length prefix.
    pub fn put_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over canonical envelope bytes.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Open an envelope, checking its domain tag.
    pub fn new(buf: &'a [u8], domain: &str) -> Result<Self> {
        let mut decoder = Self { buf, pos: 0 };
        let tag = decoder.read_str()?;
        if tag != domain {
            return Err(Error::malformed(format!(
                "unexpected domain tag {tag:?}, expected {domain:?}"
            )));
        }
        Ok(decoder)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::malformed(format!(
                    "truncated envelope: need {} bytes at offset {}",
                    len, self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(self.take(N)?);
        Ok(raw)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_be_bytes(self.read_fixed::<4>()?) as usize;
        if len > MAX_FIELD_LEN {
            return Err(Error::malformed(format!("field length {len} exceeds limit")));
        }
        self.take(len)
    }

    pub fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|e| Error::malformed(format!("invalid utf-8: {e}")))
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Serde adapter storing fixed-size byte arrays as lowercase hex strings.
pub mod hex_array {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(D::Error::custom)?;
        let len = raw.len();
        raw.try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, got {len}")))
    }
}
