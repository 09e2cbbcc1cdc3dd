//! Deduplicating table of `(path, content key)` pairs addressed by byte
//! offset.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use color_eyre::{Result, eyre::bail};
use derive_more::Debug;

use crate::{
    CasKey,
    binary::{BinaryReader, write_7bit},
};

/// Append-only table mapping content keys to the paths they were seen at.
///
/// ## Layout
///
/// Like [`CompactPathTable`](crate::CompactPathTable) this is a byte arena
/// with a reserved zero byte at offset `0`. Every record is:
///
/// ```not_rust
/// varint pathOffset   (into the path table that accompanies this table)
/// 20 bytes CasKey
/// ```
///
/// The same content is commonly referenced from several paths (a header
/// copied into two include directories, an empty file), so the lookup from
/// key to records is one-to-many. Adding a pair that is already present
/// returns the existing offset.
#[derive(Debug)]
#[debug("CompactCasKeyTable(size = {})", self.size())]
pub struct CompactCasKeyTable {
    inner: RwLock<CasTableInner>,
}

#[derive(Clone)]
struct CasTableInner {
    memory: Vec<u8>,
    lookup: HashMap<CasKey, Value>,
}

/// Offsets recorded for a single key.
///
/// Nearly every key is seen at exactly one path, so the single pair is kept
/// inline and only the rare one-to-many case allocates.
#[derive(Clone, Debug)]
enum Value {
    Single(PathAndCasOffset),
    Multiple(Vec<PathAndCasOffset>),
}

/// A record in the table: where the path lives in the path table and where
/// the record itself lives in this table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PathAndCasOffset {
    pub path_offset: u32,
    pub cas_offset: u32,
}

impl Value {
    fn find(&self, path_offset: u32) -> Option<u32> {
        self.iter()
            .find(|pair| pair.path_offset == path_offset)
            .map(|pair| pair.cas_offset)
    }

    fn push(&mut self, pair: PathAndCasOffset) {
        match self {
            Value::Single(existing) => *self = Value::Multiple(vec![*existing, pair]),
            Value::Multiple(pairs) => pairs.push(pair),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &PathAndCasOffset> {
        match self {
            Value::Single(pair) => std::slice::from_ref(pair).iter(),
            Value::Multiple(pairs) => pairs.iter(),
        }
    }
}

impl CompactCasKeyTable {
    /// Size of an empty table; offset `0` is never a valid record.
    pub const INITIAL_SIZE: u32 = 1;

    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CasTableInner {
                memory: vec![0],
                lookup: HashMap::new(),
            }),
        }
    }

    /// Add a key seen at `path_offset`, returning the record offset and the
    /// table size a peer needs to resolve it.
    pub fn add(&self, key: &CasKey, path_offset: u32) -> (u32, u32) {
        self.write().add(key, path_offset)
    }

    /// Same as [`CompactCasKeyTable::add`] without taking the lock.
    pub fn add_mut(&mut self, key: &CasKey, path_offset: u32) -> (u32, u32) {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .add(key, path_offset)
    }

    /// Read the key stored at `offset`.
    pub fn get_key(&self, offset: u32) -> Result<CasKey> {
        self.read().record(offset).map(|(_, key, _)| key)
    }

    /// Read the path offset and key stored at `offset`.
    pub fn get_path_and_key(&self, offset: u32) -> Result<(u32, CasKey)> {
        self.read()
            .record(offset)
            .map(|(path_offset, key, _)| (path_offset, key))
    }

    /// Every record registered for `key`, each exactly once, in the order
    /// they were added.
    ///
    /// The pairs are copied out under the lock, so the iterator can outlive
    /// concurrent additions.
    pub fn traverse_offsets(&self, key: &CasKey) -> impl Iterator<Item = PathAndCasOffset> {
        let pairs = match self.read().lookup.get(key) {
            Some(value) => value.iter().copied().collect::<Vec<_>>(),
            None => Vec::new(),
        };
        pairs.into_iter()
    }

    /// Whether any record exists for `key`.
    pub fn contains(&self, key: &CasKey) -> bool {
        self.read().lookup.contains_key(key)
    }

    /// Append raw table bytes from a peer; see
    /// [`CompactPathTable::read_mem`](crate::CompactPathTable::read_mem).
    pub fn read_mem(&self, bytes: &[u8], populate_lookup: bool) -> Result<()> {
        self.write().read_mem(bytes, populate_lookup)
    }

    /// Copy of the table bytes from `from` to the current end.
    pub fn memory_from(&self, from: u32) -> Vec<u8> {
        let inner = self.read();
        let from = (from as usize).min(inner.memory.len());
        inner.memory[from..].to_vec()
    }

    /// Current size of the table in bytes.
    pub fn size(&self) -> u32 {
        self.read().memory.len() as u32
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.read().lookup.len()
    }

    /// Replace the content of this table with `other`, handing the previous
    /// content back through `other`.
    pub fn swap(&self, other: &mut CompactCasKeyTable) {
        let other = other.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut *self.write(), other);
    }

    fn read(&self) -> RwLockReadGuard<'_, CasTableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CasTableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CompactCasKeyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CasTableInner {
    fn add(&mut self, key: &CasKey, path_offset: u32) -> (u32, u32) {
        if let Some(existing) = self.lookup.get(key).and_then(|v| v.find(path_offset)) {
            let end = self
                .record(existing)
                .map(|(_, _, end)| end)
                .unwrap_or(self.memory.len() as u32);
            return (existing, end);
        }

        let cas_offset = self.memory.len() as u32;
        write_7bit(&mut self.memory, u64::from(path_offset));
        self.memory.extend_from_slice(key.as_bytes());
        let pair = PathAndCasOffset {
            path_offset,
            cas_offset,
        };
        match self.lookup.get_mut(key) {
            Some(value) => value.push(pair),
            None => {
                self.lookup.insert(*key, Value::Single(pair));
            }
        }
        (cas_offset, self.memory.len() as u32)
    }

    fn record(&self, offset: u32) -> Result<(u32, CasKey, u32)> {
        let start = offset as usize;
        if start == 0 || start >= self.memory.len() {
            bail!(
                "cas key offset {offset} out of range (table size {})",
                self.memory.len()
            );
        }
        let mut reader = BinaryReader::new(&self.memory[start..]);
        let path_offset = reader.read_7bit_u32()?;
        let key = reader.read_cas_key()?;
        Ok((path_offset, key, offset + reader.position() as u32))
    }

    fn read_mem(&mut self, bytes: &[u8], populate_lookup: bool) -> Result<()> {
        let base = self.memory.len();
        let mut reader = BinaryReader::new(bytes);
        let mut parsed = Vec::new();
        while !reader.is_at_end() {
            let cas_offset = (base + reader.position()) as u32;
            let path_offset = reader.read_7bit_u32()?;
            let key = reader.read_cas_key()?;
            if populate_lookup {
                parsed.push((
                    key,
                    PathAndCasOffset {
                        path_offset,
                        cas_offset,
                    },
                ));
            }
        }

        self.memory.extend_from_slice(bytes);
        for (key, pair) in parsed {
            match self.lookup.get_mut(&key) {
                Some(value) if value.find(pair.path_offset).is_some() => {}
                Some(value) => value.push(pair),
                None => {
                    self.lookup.insert(key, Value::Single(pair));
                }
            }
        }
        Ok(())
    }
}
