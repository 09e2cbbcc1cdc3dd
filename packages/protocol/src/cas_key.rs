//! Content keys for the content-addressed store.

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{instrument, trace};

/// The key to a content-addressed storage blob.
///
/// A key is the BLAKE3 digest of the content truncated to 20 bytes. The two
/// low bits of the last byte are not part of the digest: they carry flags
/// describing how the content was produced.
///
/// ## Flag bits
///
/// Byte 19 is reserved for flags and is a bit-exact contract with peers:
/// - `0x1`: the blob is stored compressed.
/// - `0x2`: the content was normalized (root paths substituted) before
///   hashing, so it must be denormalized before use on a given machine.
///
/// Equality and hashing are byte-exact, so two keys for the same content that
/// differ only in flags are different keys.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct CasKey([u8; CasKey::SIZE]);

impl CasKey {
    /// Size of a key in bytes.
    pub const SIZE: usize = 20;

    /// The "no key" value.
    pub const ZERO: CasKey = CasKey([0; Self::SIZE]);

    const FLAGS_BYTE: usize = Self::SIZE - 1;
    const FLAG_COMPRESSED: u8 = 0x1;
    const FLAG_NORMALIZED: u8 = 0x2;
    const FLAG_MASK: u8 = Self::FLAG_COMPRESSED | Self::FLAG_NORMALIZED;

    /// View the key as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Attempt to parse the key from a hex string.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        trace!(len = bytes.len(), "decoded hex");
        Self::from_bytes(bytes)
    }

    /// View the key as bytes.
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Parse a key from raw bytes (the inverse of `as_bytes`).
    ///
    /// The flag bits are kept exactly as given.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let Ok(key) = <[u8; Self::SIZE]>::try_from(bytes) else {
            bail!(
                "invalid key length: expected {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            );
        };
        Ok(Self(key))
    }

    /// Create a key from a finished hasher, with all flags cleared.
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        let hash = hasher.finalize();
        let mut key = [0; Self::SIZE];
        key.copy_from_slice(&hash.as_bytes()[..Self::SIZE]);
        key[Self::FLAGS_BYTE] &= !Self::FLAG_MASK;
        Self(key)
    }

    /// Hash the contents of a buffer to create a key.
    ///
    /// This is NOT for parsing keys that are already in binary format: use
    /// `from_bytes` for that.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer.as_ref());
        Self::from_hasher(&hasher)
    }

    /// Hash the contents of the iterator in order.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_ref());
        }
        Self::from_hasher(&hasher)
    }

    /// Whether the key is the "no key" value.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whether the content was normalized before hashing.
    pub fn is_normalized(&self) -> bool {
        self.0[Self::FLAGS_BYTE] & Self::FLAG_NORMALIZED != 0
    }

    /// Copy of the key with the normalized flag set or cleared.
    /// No other bit is touched.
    #[must_use]
    pub fn as_normalized(mut self, normalized: bool) -> Self {
        self.set_flag(Self::FLAG_NORMALIZED, normalized);
        self
    }

    /// Whether the blob is stored compressed.
    pub fn is_compressed(&self) -> bool {
        self.0[Self::FLAGS_BYTE] & Self::FLAG_COMPRESSED != 0
    }

    /// Copy of the key with the compressed flag set or cleared.
    /// No other bit is touched.
    #[must_use]
    pub fn as_compressed(mut self, compressed: bool) -> Self {
        self.set_flag(Self::FLAG_COMPRESSED, compressed);
        self
    }

    /// The key with both flags cleared: identifies the raw content digest.
    #[must_use]
    pub fn without_flags(mut self) -> Self {
        self.0[Self::FLAGS_BYTE] &= !Self::FLAG_MASK;
        self
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.0[Self::FLAGS_BYTE] |= flag;
        } else {
            self.0[Self::FLAGS_BYTE] &= !flag;
        }
    }
}

impl From<&CasKey> for CasKey {
    fn from(key: &CasKey) -> Self {
        *key
    }
}

impl AsRef<[u8]> for CasKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for CasKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CasKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
