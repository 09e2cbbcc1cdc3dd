//! Little-endian binary reader and writer used for messages and persisted
//! state.
//!
//! Variable-length integers use the 7-bit encoding: each byte carries seven
//! bits of the value, low bits first, with the high bit set on every byte but
//! the last. This is the unsigned LEB128 form `integer_encoding` produces.

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::Debug;
use integer_encoding::VarInt as _;

use crate::CasKey;

/// Maximum encoded length of a `u64` varint.
const MAX_VARINT_LEN: usize = 10;

/// Append-only writer over an owned buffer.
#[derive(Clone, Default, Debug)]
#[debug("BinaryWriter(len = {})", self.buffer.len())]
pub struct BinaryWriter {
    buffer: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a 7-bit encoded variable-length integer.
    pub fn write_7bit(&mut self, value: u64) {
        write_7bit(&mut self.buffer, value);
    }

    /// Write raw bytes with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Write bytes prefixed by their varint length.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_7bit(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    /// Write a UTF-8 string prefixed by its varint byte length.
    pub fn write_string(&mut self, value: &str) {
        self.write_blob(value.as_bytes());
    }

    pub fn write_cas_key(&mut self, key: &CasKey) {
        self.write_bytes(key.as_bytes());
    }
}

/// Cursor over a borrowed buffer.
///
/// Every read checks bounds and fails with context instead of panicking, since
/// the bytes usually come from a peer or from disk.
#[derive(Clone, Debug)]
#[debug("BinaryReader(position = {}, len = {})", self.position, self.buffer.len())]
pub struct BinaryReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Read `len` bytes, borrowing them from the underlying buffer.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or_else(|| {
                eyre!(
                    "read past end of buffer: want {len} bytes at {}, have {}",
                    self.position,
                    self.remaining()
                )
            })?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("invalid bool byte: {other}"),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut value = [0; 8];
        value.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(value))
    }

    /// Read a 7-bit encoded variable-length integer.
    pub fn read_7bit(&mut self) -> Result<u64> {
        let (value, len) = read_7bit(&self.buffer[self.position..])
            .with_context(|| format!("read varint at {}", self.position))?;
        self.position += len;
        Ok(value)
    }

    /// Read a varint that must fit in a `u32`.
    pub fn read_7bit_u32(&mut self) -> Result<u32> {
        let value = self.read_7bit()?;
        u32::try_from(value).map_err(|_| eyre!("varint {value} does not fit in u32"))
    }

    /// Read a varint used as a length and check it against the remaining
    /// bytes before anything is allocated.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_7bit()?;
        let len = usize::try_from(len).map_err(|_| eyre!("length {len} overflows usize"))?;
        if len > self.remaining() {
            bail!("length {len} exceeds remaining {} bytes", self.remaining());
        }
        Ok(len)
    }

    /// Read bytes prefixed by their varint length.
    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes.to_vec()).context("decode utf-8 string")
    }

    pub fn read_cas_key(&mut self) -> Result<CasKey> {
        CasKey::from_bytes(self.read_bytes(CasKey::SIZE)?)
    }
}

/// Append a 7-bit encoded integer to `buffer`.
pub fn write_7bit(buffer: &mut Vec<u8>, value: u64) {
    let mut encoded = [0; MAX_VARINT_LEN];
    let len = value.encode_var(&mut encoded);
    buffer.extend_from_slice(&encoded[..len]);
}

/// Decode a 7-bit encoded integer from the start of `bytes`, returning the
/// value and the number of bytes consumed.
pub fn read_7bit(bytes: &[u8]) -> Result<(u64, usize)> {
    match u64::decode_var(bytes) {
        Some((_, MAX_VARINT_LEN)) if bytes[MAX_VARINT_LEN - 1] > 1 => bail!("varint overflows u64"),
        Some((value, len)) => Ok((value, len)),
        None if bytes.len() < MAX_VARINT_LEN => bail!("truncated varint"),
        None => bail!("varint longer than {MAX_VARINT_LEN} bytes"),
    }
}

/// Iterator over a buffer of back-to-back varints.
///
/// Used to walk offset lists without decoding them into a `Vec`. The buffers
/// it walks were produced by this crate, so a malformed varint ends the
/// iteration instead of yielding an error.
#[derive(Clone, Debug)]
pub struct Varints<'a> {
    bytes: &'a [u8],
}

impl<'a> Varints<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl Iterator for Varints<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        match read_7bit(self.bytes) {
            Ok((value, len)) => {
                self.bytes = &self.bytes[len..];
                u32::try_from(value).ok()
            }
            Err(_) => {
                self.bytes = &[];
                None
            }
        }
    }
}

/// Encode a list of offsets as back-to-back varints.
pub fn encode_varints(values: impl IntoIterator<Item = u32>) -> Vec<u8> {
    let values = values.into_iter();
    let mut buffer = Vec::with_capacity(values.size_hint().0);
    for value in values {
        write_7bit(&mut buffer, u64::from(value));
    }
    buffer
}
