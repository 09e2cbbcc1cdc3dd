//! Deduplicating table of path strings addressed by byte offset.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};

use crate::binary::{BinaryReader, write_7bit};

/// How path segments are compared when deduplicating.
///
/// With [`CaseSensitivity::Insensitive`] the first spelling added wins: later
/// additions that differ only in case resolve to the existing offset and
/// [`CompactPathTable::get_string`] returns the original spelling.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    Insensitive,
}

/// Append-only table of paths stored as a tree of segments.
///
/// ## Layout
///
/// The table is a single byte arena. Offset `0` is a reserved zero byte that
/// stands for the empty path; every other offset is the start of a node:
///
/// ```not_rust
/// varint parentOffset
/// varint segmentLength
/// segmentLength bytes of UTF-8
/// ```
///
/// Each segment carries its leading separator, so `/usr/include/a.h` is
/// stored as `/usr` → `/include` → `/a.h` and concatenating a node's
/// ancestors reproduces the path byte for byte. Paths sharing a directory
/// share its nodes.
///
/// ## Offsets
///
/// Offsets are byte positions, never pointers, and the arena only appends.
/// Once returned an offset is valid for the life of the table, which is what
/// lets cache entries and remote peers refer to paths by offset. Parents are
/// always written before their children, so a peer that holds the first
/// `required_size` bytes can resolve the returned offset.
///
/// ## Locking
///
/// The table carries its own lock. [`CompactPathTable::add`] locks;
/// [`CompactPathTable::add_mut`] is the fast path for callers that already
/// have exclusive access (for example while rebuilding a table during
/// maintenance).
#[derive(Debug)]
#[debug("CompactPathTable(size = {})", self.size())]
pub struct CompactPathTable {
    inner: RwLock<PathTableInner>,
}

#[derive(Clone)]
struct PathTableInner {
    memory: Vec<u8>,
    lookup: HashMap<SegmentKey, u32>,
    case: CaseSensitivity,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct SegmentKey {
    parent: u32,
    segment: Box<str>,
}

impl CompactPathTable {
    /// Size of an empty table; offset `0` is the empty path.
    pub const INITIAL_SIZE: u32 = 1;

    pub fn new(case: CaseSensitivity) -> Self {
        Self {
            inner: RwLock::new(PathTableInner {
                memory: vec![0],
                lookup: HashMap::new(),
                case,
            }),
        }
    }

    /// Add a path, returning its offset and the table size a peer needs to
    /// resolve that offset.
    ///
    /// Adding a path that is already present (under the table's case rules)
    /// allocates nothing and returns the existing offset.
    pub fn add(&self, path: &str) -> (u32, u32) {
        self.write().add(path)
    }

    /// Same as [`CompactPathTable::add`] without taking the lock.
    pub fn add_mut(&mut self, path: &str) -> (u32, u32) {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .add(path)
    }

    /// Reconstruct the path stored at `offset`.
    pub fn get_string(&self, offset: u32) -> Result<String> {
        self.read().get_string(offset)
    }

    /// Append raw table bytes, as produced by [`CompactPathTable::memory_from`]
    /// on a peer, to the end of this table.
    ///
    /// The bytes must continue exactly where this table ends. With
    /// `populate_lookup` the dedup map is rebuilt for the new nodes; tables
    /// that are only ever read by offset (mirrors of a peer's table) skip it.
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

    /// Number of distinct segments in the table.
    pub fn segment_count(&self) -> usize {
        self.read().lookup.len()
    }

    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.read().case
    }

    /// Replace the content of this table with `other`, handing the previous
    /// content back through `other`.
    pub fn swap(&self, other: &mut CompactPathTable) {
        let other = other.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut *self.write(), other);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PathTableInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PathTableInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CompactPathTable {
    fn default() -> Self {
        Self::new(CaseSensitivity::default())
    }
}

impl PathTableInner {
    fn add(&mut self, path: &str) -> (u32, u32) {
        let mut parent = 0;
        let mut required = CompactPathTable::INITIAL_SIZE;
        for segment in segments(path) {
            let key = SegmentKey {
                parent,
                segment: fold(segment, self.case),
            };
            if let Some(&existing) = self.lookup.get(&key) {
                parent = existing;
                continue;
            }

            let offset = self.memory.len() as u32;
            write_7bit(&mut self.memory, u64::from(parent));
            write_7bit(&mut self.memory, segment.len() as u64);
            self.memory.extend_from_slice(segment.as_bytes());
            self.lookup.insert(key, offset);
            parent = offset;
        }

        if parent != 0 {
            required = self.node_end(parent);
        }
        (parent, required)
    }

    /// End of the node starting at `offset`. Only called for offsets this
    /// table handed out, which always decode.
    fn node_end(&self, offset: u32) -> u32 {
        self.node(offset)
            .map(|node| node.end)
            .unwrap_or(self.memory.len() as u32)
    }

    fn node(&self, offset: u32) -> Result<Node<'_>> {
        let start = offset as usize;
        if start == 0 || start >= self.memory.len() {
            bail!("path offset {offset} out of range (table size {})", self.memory.len());
        }
        let mut reader = BinaryReader::new(&self.memory[start..]);
        let parent = reader.read_7bit_u32()?;
        let segment = reader.read_blob()?;
        let segment = std::str::from_utf8(segment).context("decode path segment")?;
        Ok(Node {
            parent,
            segment,
            end: offset + reader.position() as u32,
        })
    }

    fn get_string(&self, offset: u32) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = offset;
        while current != 0 {
            let node = self
                .node(current)
                .with_context(|| format!("resolve path at offset {offset}"))?;
            if node.parent >= current {
                bail!("path node at {current} points forward to {}", node.parent);
            }
            segments.push(node.segment);
            current = node.parent;
        }
        Ok(segments.into_iter().rev().collect())
    }

    fn read_mem(&mut self, bytes: &[u8], populate_lookup: bool) -> Result<()> {
        let base = self.memory.len();
        let mut reader = BinaryReader::new(bytes);
        let mut parsed = Vec::new();
        while !reader.is_at_end() {
            let offset = (base + reader.position()) as u32;
            let parent = reader.read_7bit_u32()?;
            let segment = reader.read_blob()?;
            if parent >= offset {
                bail!("path node at {offset} points forward to {parent}");
            }
            let segment = std::str::from_utf8(segment).context("decode path segment")?;
            if populate_lookup {
                parsed.push((
                    SegmentKey {
                        parent,
                        segment: fold(segment, self.case),
                    },
                    offset,
                ));
            }
        }

        self.memory.extend_from_slice(bytes);
        for (key, offset) in parsed {
            self.lookup.entry(key).or_insert(offset);
        }
        Ok(())
    }
}

struct Node<'a> {
    parent: u32,
    segment: &'a str,
    end: u32,
}

fn fold(segment: &str, case: CaseSensitivity) -> Box<str> {
    match case {
        CaseSensitivity::Sensitive => Box::from(segment),
        CaseSensitivity::Insensitive => segment.to_lowercase().into_boxed_str(),
    }
}

/// Split a path into segments that each start at a separator (except
/// possibly the first).
fn segments(path: &str) -> impl Iterator<Item = &str> {
    let mut start = 0;
    let mut bounds = path
        .bytes()
        .enumerate()
        .filter(|(_, b)| *b == b'/' || *b == b'\\')
        .map(|(index, _)| index)
        .chain(std::iter::once(path.len()));
    std::iter::from_fn(move || {
        loop {
            let end = bounds.next()?;
            if end > start {
                let segment = &path[start..end];
                start = end;
                return Some(segment);
            }
        }
    })
}
