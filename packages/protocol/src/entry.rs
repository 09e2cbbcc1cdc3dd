//! Cache entries: the recorded inputs, outputs and log of one build action.
//!
//! All input and output references are byte offsets into the bucket's
//! [`CompactCasKeyTable`](crate::CompactCasKeyTable), stored as back-to-back
//! varints. Entries for the same command tend to share most of their inputs
//! (system headers, the precompiled header, the toolchain itself), so each
//! [`CacheEntries`] container keeps a pool of input offsets that entries
//! reference by byte range instead of repeating them.

use std::{
    collections::{HashMap, VecDeque},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::{Debug, Display};
use strum::FromRepr;
use tracing::{instrument, trace, warn};

use crate::{
    CACHE_DATABASE_VERSION,
    binary::{BinaryReader, BinaryWriter, Varints, encode_varints, read_7bit},
};

/// Oldest persisted layout that can still be read. Version 2 did not record
/// creation times.
pub const OLDEST_READABLE_DATABASE_VERSION: u32 = 2;

/// Runs of shared inputs shorter than this are stored as extra inputs; a
/// single-element range costs more than the element itself.
const MIN_RANGE_ELEMENTS: usize = 2;

/// Most entries one command keeps; the serialized count is a `u16`.
pub const MAX_ENTRIES: usize = u16::MAX as usize;

/// Where an entry's log lines are stored.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, Default, FromRepr)]
#[repr(u8)]
pub enum LogLinesType {
    /// The process printed nothing.
    #[default]
    Empty = 0,

    /// The log is identical to the container's shared log.
    Shared = 1,

    /// The entry carries its own log blob.
    Owned = 2,
}

/// A single build result.
///
/// Offsets are stored encoded; use [`CacheEntry::inputs`] and
/// [`CacheEntry::outputs`] to walk them.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct CacheEntry {
    pub id: u32,
    pub creation_time: u64,
    pub last_used_time: u64,
    pub log_lines_type: LogLinesType,

    /// Pairs of `(begin, end)` byte positions into the container's shared
    /// input pool.
    #[debug("{} bytes", shared_input_ranges.len())]
    pub shared_input_ranges: Vec<u8>,

    /// Input offsets not covered by a shared range.
    #[debug("{} bytes", extra_inputs.len())]
    pub extra_inputs: Vec<u8>,

    #[debug("{} bytes", outputs.len())]
    pub outputs: Vec<u8>,

    /// Only populated when `log_lines_type` is [`LogLinesType::Owned`].
    #[debug("{} bytes", log_lines.len())]
    pub log_lines: Vec<u8>,
}

impl CacheEntry {
    /// Every input offset of the entry: the shared ranges first, then the
    /// extras.
    pub fn inputs<'a>(&'a self, shared_inputs: &'a [u8]) -> impl Iterator<Item = u32> + 'a {
        traverse_inputs(shared_inputs, &self.shared_input_ranges, &self.extra_inputs)
    }

    pub fn outputs(&self) -> Varints<'_> {
        Varints::new(&self.outputs)
    }

    /// The entry's log blob, resolving the shared case.
    pub fn log_lines<'a>(&'a self, shared_log_lines: &'a [u8]) -> &'a [u8] {
        match self.log_lines_type {
            LogLinesType::Empty => &[],
            LogLinesType::Shared => shared_log_lines,
            LogLinesType::Owned => &self.log_lines,
        }
    }

    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_7bit(u64::from(self.id));
        writer.write_7bit(self.creation_time);
        writer.write_7bit(self.last_used_time);
        writer.write_u8(self.log_lines_type as u8);
        writer.write_blob(&self.extra_inputs);
        writer.write_blob(&self.shared_input_ranges);
        writer.write_blob(&self.outputs);
        if self.log_lines_type == LogLinesType::Owned {
            writer.write_blob(&self.log_lines);
        }
    }
}

/// Result of [`CacheEntries::add_entry`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AddedEntry {
    /// A new entry was created with this id.
    New(u32),

    /// An entry with the same inputs and outputs already existed; it was
    /// marked as used instead.
    Existing(u32),
}

impl AddedEntry {
    pub fn id(&self) -> u32 {
        match self {
            AddedEntry::New(id) | AddedEntry::Existing(id) => *id,
        }
    }
}

/// An entry with its offsets decoded, used when the encoded form has to be
/// rebuilt.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ResolvedEntry {
    pub id: u32,
    pub creation_time: u64,
    pub last_used_time: u64,

    /// Sorted, deduplicated.
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub log_lines: Vec<u8>,
}

/// Every entry recorded for one command key.
///
/// Entries are kept most recently used first. IDs are assigned under the
/// write lock from a counter that only grows, so they are unique and
/// strictly increasing in insertion order.
///
/// ## Shared input pool
///
/// The first entry stored seeds the pool with its full (sorted) input list
/// and becomes the primary. Later entries walk the pool and describe every
/// run of consecutive pool elements they also use as a byte range; inputs
/// outside any run are stored as extras. The pool is never rewritten while
/// its primary exists. When the primary is removed, or when maintenance
/// remaps offsets, the pool is rebuilt from the most recently used entry.
#[derive(Debug, Default)]
#[debug("CacheEntries(len = {})", self.len())]
pub struct CacheEntries {
    inner: RwLock<EntriesInner>,
}

#[derive(Clone, Default, PartialEq, Eq)]
struct EntriesInner {
    entries: VecDeque<CacheEntry>,
    shared_inputs: Vec<u8>,
    shared_log_lines: Vec<u8>,
    id_counter: u32,
    primary_id: u32,
}

impl CacheEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read_inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_inner().entries.is_empty()
    }

    /// The id most recently assigned; `0` when nothing was ever stored.
    pub fn id_counter(&self) -> u32 {
        self.read_inner().id_counter
    }

    /// The entry whose inputs seeded the shared pool; `0` when empty.
    pub fn primary_id(&self) -> u32 {
        self.read_inner().primary_id
    }

    /// Entry ids, most recently used first.
    pub fn ids(&self) -> Vec<u32> {
        self.read_inner().entries.iter().map(|entry| entry.id).collect()
    }

    /// Copy of the entry with `id`.
    pub fn entry(&self, id: u32) -> Option<CacheEntry> {
        self.read_inner().entries.iter().find(|entry| entry.id == id).cloned()
    }

    /// Every entry with its offsets decoded, most recently used first.
    pub fn resolved(&self) -> Vec<ResolvedEntry> {
        self.read_inner().resolve_all()
    }

    /// Store a build result.
    ///
    /// `inputs` need not be sorted or unique. If an entry with the same input
    /// set and outputs already exists, its `last_used_time` is bumped and it
    /// moves to the front instead.
    ///
    /// A container already holding [`MAX_ENTRIES`] drops its least recently
    /// used entry to make room.
    #[instrument(name = "CacheEntries::add_entry", skip_all, fields(inputs = inputs.len(), outputs = outputs.len()))]
    pub fn add_entry(&self, inputs: &[u32], outputs: &[u32], log_lines: Vec<u8>, now: u64) -> AddedEntry {
        self.add_entry_within(inputs, outputs, log_lines, now, MAX_ENTRIES)
    }

    fn add_entry_within(
        &self,
        inputs: &[u32],
        outputs: &[u32],
        log_lines: Vec<u8>,
        now: u64,
        max_entries: usize,
    ) -> AddedEntry {
        let mut inputs = inputs.to_vec();
        inputs.sort_unstable();
        inputs.dedup();
        let outputs = encode_varints(outputs.iter().copied());

        let mut inner = self.write_inner();
        let existing = inner.entries.iter().position(|entry| {
            entry.outputs == outputs && sorted_inputs(entry, &inner.shared_inputs) == inputs
        });
        if let Some(index) = existing {
            let id = inner.touch_at(index, now);
            trace!(id, "identical entry already stored");
            return AddedEntry::Existing(id);
        }

        inner.id_counter += 1;
        let id = inner.id_counter;
        if inner.entries.is_empty() {
            inner.shared_inputs = encode_varints(inputs.iter().copied());
            inner.shared_log_lines.clear();
            inner.primary_id = id;
        }
        let (shared_input_ranges, extra_inputs) = build_inputs(&inner.shared_inputs, &inputs);
        let (log_lines_type, log_lines) = inner.classify_log(log_lines);
        inner.entries.push_front(CacheEntry {
            id,
            creation_time: now,
            last_used_time: now,
            log_lines_type,
            shared_input_ranges,
            extra_inputs,
            outputs,
            log_lines,
        });
        if inner.entries.len() > max_entries {
            let dropped = inner.entries.split_off(max_entries);
            warn!(dropped = dropped.len(), "container full, dropped least recently used entries");
            let primary_id = inner.primary_id;
            if dropped.iter().any(|entry| entry.id == primary_id) {
                let resolved = inner.resolve_all();
                inner.assemble(resolved);
            }
        }
        trace!(id, "stored entry");
        AddedEntry::New(id)
    }

    /// Mark the entry as used: bump its `last_used_time` and move it to the
    /// front. Returns false if no such entry exists.
    pub fn touch(&self, id: u32, now: u64) -> bool {
        let mut inner = self.write_inner();
        match inner.entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                inner.touch_at(index, now);
                true
            }
            None => false,
        }
    }

    /// Keep only the entries for which `keep` returns true; the closure also
    /// gets the shared pool so it can walk the entry's inputs. Returns the
    /// number of entries removed.
    ///
    /// Removing the primary rebuilds the shared pool from the survivors.
    pub fn retain(&self, mut keep: impl FnMut(&CacheEntry, &[u8]) -> bool) -> usize {
        let mut inner = self.write_inner();
        let before = inner.entries.len();
        let EntriesInner {
            entries,
            shared_inputs,
            ..
        } = &mut *inner;
        let shared_inputs = shared_inputs.as_slice();
        entries.retain(|entry| keep(entry, shared_inputs));

        let removed = before - inner.entries.len();
        let primary_id = inner.primary_id;
        if removed > 0 && !inner.entries.iter().any(|entry| entry.id == primary_id) {
            let resolved = inner.resolve_all();
            inner.assemble(resolved);
        }
        removed
    }

    /// Drop the least recently used entries so at most `max` remain.
    pub fn truncate(&self, max: usize) -> usize {
        let mut inner = self.write_inner();
        if inner.entries.len() <= max {
            return 0;
        }
        let mut entries = inner.resolve_all();
        entries.sort_by(|a, b| b.last_used_time.cmp(&a.last_used_time));
        let removed = entries.len() - max;
        entries.truncate(max);
        inner.assemble(entries);
        removed
    }

    /// Rewrite every offset through `remap` (old cas table offset to new).
    ///
    /// Entries referencing an offset missing from `remap` are dropped, since
    /// their inputs or outputs can no longer be resolved. The shared pool is
    /// rebuilt with the most recently used entry as primary. Returns the
    /// number of entries dropped.
    #[instrument(name = "CacheEntries::update_entries", skip_all)]
    pub fn update_entries(&self, remap: &HashMap<u32, u32>) -> usize {
        let mut inner = self.write_inner();
        let resolved = inner.resolve_all();
        let before = resolved.len();
        let remapped = resolved
            .into_iter()
            .filter_map(|entry| {
                let inputs = entry
                    .inputs
                    .iter()
                    .map(|offset| remap.get(offset).copied())
                    .collect::<Option<Vec<_>>>()?;
                let outputs = entry
                    .outputs
                    .iter()
                    .map(|offset| remap.get(offset).copied())
                    .collect::<Option<Vec<_>>>()?;
                Some(ResolvedEntry {
                    inputs,
                    outputs,
                    ..entry
                })
            })
            .collect::<Vec<_>>();
        let dropped = before - remapped.len();
        inner.assemble(remapped);
        trace!(dropped, "remapped entries");
        dropped
    }

    /// Serialize in the current layout.
    ///
    /// At most `u16::MAX` entries are written, most recently used first.
    pub fn write(&self, writer: &mut BinaryWriter) {
        let inner = self.read_inner();
        writer.write_7bit(u64::from(inner.id_counter));
        writer.write_7bit(u64::from(inner.primary_id));
        writer.write_blob(&inner.shared_inputs);
        writer.write_blob(&inner.shared_log_lines);
        let count = u16::try_from(inner.entries.len()).unwrap_or_else(|_| {
            warn!(
                entries = inner.entries.len(),
                "writing only the {} most recently used entries",
                u16::MAX
            );
            u16::MAX
        });
        writer.write_u16(count);
        for entry in inner.entries.iter().take(usize::from(count)) {
            entry.write(writer);
        }
    }

    /// Deserialize entries written by [`CacheEntries::write`] in
    /// `database_version`'s layout.
    pub fn read(reader: &mut BinaryReader<'_>, database_version: u32) -> Result<Self> {
        let mut traverser = CacheEntriesTraverser::from_reader(reader, database_version)?;
        let mut inner = EntriesInner {
            entries: VecDeque::with_capacity(usize::from(traverser.entry_count())),
            shared_inputs: traverser.shared_inputs().to_vec(),
            shared_log_lines: traverser.shared_log_lines().to_vec(),
            id_counter: traverser.id_counter(),
            primary_id: traverser.primary_id(),
        };
        for view in traverser.by_ref() {
            inner.entries.push_back(view?.to_entry());
        }
        *reader = traverser.into_reader();
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, EntriesInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, EntriesInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for CacheEntries {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.read_inner().clone()),
        }
    }
}

impl EntriesInner {
    fn touch_at(&mut self, index: usize, now: u64) -> u32 {
        let Some(mut entry) = self.entries.remove(index) else {
            return 0;
        };
        entry.last_used_time = entry.last_used_time.max(now);
        let id = entry.id;
        self.entries.push_front(entry);
        id
    }

    fn classify_log(&mut self, log_lines: Vec<u8>) -> (LogLinesType, Vec<u8>) {
        if log_lines.is_empty() {
            (LogLinesType::Empty, Vec::new())
        } else if self.shared_log_lines.is_empty() {
            self.shared_log_lines = log_lines;
            (LogLinesType::Shared, Vec::new())
        } else if self.shared_log_lines == log_lines {
            (LogLinesType::Shared, Vec::new())
        } else {
            (LogLinesType::Owned, log_lines)
        }
    }

    fn resolve_all(&self) -> Vec<ResolvedEntry> {
        self.entries
            .iter()
            .map(|entry| ResolvedEntry {
                id: entry.id,
                creation_time: entry.creation_time,
                last_used_time: entry.last_used_time,
                inputs: sorted_inputs(entry, &self.shared_inputs),
                outputs: entry.outputs().collect(),
                log_lines: entry.log_lines(&self.shared_log_lines).to_vec(),
            })
            .collect()
    }

    /// Rebuild the container from decoded entries, keeping their order and
    /// ids. The first entry becomes the primary.
    fn assemble(&mut self, entries: Vec<ResolvedEntry>) {
        self.entries.clear();
        self.shared_log_lines.clear();
        match entries.first() {
            Some(primary) => {
                let mut inputs = primary.inputs.clone();
                inputs.sort_unstable();
                inputs.dedup();
                self.shared_inputs = encode_varints(inputs);
                self.primary_id = primary.id;
            }
            None => {
                self.shared_inputs.clear();
                self.primary_id = 0;
            }
        }

        for entry in entries {
            let mut inputs = entry.inputs;
            inputs.sort_unstable();
            inputs.dedup();
            let (shared_input_ranges, extra_inputs) = build_inputs(&self.shared_inputs, &inputs);
            let (log_lines_type, log_lines) = self.classify_log(entry.log_lines);
            self.entries.push_back(CacheEntry {
                id: entry.id,
                creation_time: entry.creation_time,
                last_used_time: entry.last_used_time,
                log_lines_type,
                shared_input_ranges,
                extra_inputs,
                outputs: encode_varints(entry.outputs),
                log_lines,
            });
        }
    }
}

fn sorted_inputs(entry: &CacheEntry, shared_inputs: &[u8]) -> Vec<u32> {
    let mut inputs = entry.inputs(shared_inputs).collect::<Vec<_>>();
    inputs.sort_unstable();
    inputs.dedup();
    inputs
}

/// Split sorted, unique `inputs` into ranges over `shared_inputs` and extras.
fn build_inputs(shared_inputs: &[u8], inputs: &[u32]) -> (Vec<u8>, Vec<u8>) {
    let mut ranges = BinaryWriter::new();
    let mut extras = Vec::new();
    let mut wanted = inputs.iter().copied().peekable();

    // (begin, end, first value, element count) of the current run.
    let mut run: Option<(usize, usize, u32, usize)> = None;
    let mut close_run = |run: &mut Option<(usize, usize, u32, usize)>, extras: &mut Vec<u32>| {
        if let Some((begin, end, first, count)) = run.take() {
            if count >= MIN_RANGE_ELEMENTS {
                ranges.write_7bit(begin as u64);
                ranges.write_7bit(end as u64);
            } else {
                extras.push(first);
            }
        }
    };

    let mut position = 0;
    while position < shared_inputs.len() {
        let Ok((value, len)) = read_7bit(&shared_inputs[position..]) else {
            break;
        };
        let Ok(value) = u32::try_from(value) else {
            break;
        };
        while wanted.peek().is_some_and(|next| *next < value) {
            extras.extend(wanted.next());
        }
        if wanted.peek() == Some(&value) {
            wanted.next();
            run = Some(match run {
                Some((begin, _, first, count)) => (begin, position + len, first, count + 1),
                None => (position, position + len, value, 1),
            });
        } else {
            close_run(&mut run, &mut extras);
        }
        position += len;
    }
    close_run(&mut run, &mut extras);
    extras.extend(wanted);
    extras.sort_unstable();

    (ranges.into_inner(), encode_varints(extras))
}

/// Walk the shared ranges then the extras. Ranges that point outside the
/// pool yield nothing.
fn traverse_inputs<'a>(
    shared_inputs: &'a [u8],
    ranges: &'a [u8],
    extra_inputs: &'a [u8],
) -> impl Iterator<Item = u32> + 'a {
    let mut bounds = Varints::new(ranges);
    std::iter::from_fn(move || {
        let begin = bounds.next()? as usize;
        let end = bounds.next()? as usize;
        Some(shared_inputs.get(begin..end).unwrap_or_default())
    })
    .flat_map(Varints::new)
    .chain(Varints::new(extra_inputs))
}

/// Lazy reader over a serialized [`CacheEntries`].
///
/// Yields [`EntryView`]s borrowing from the buffer without building
/// [`CacheEntry`] values, which is how the client scans fetch responses.
#[derive(Debug)]
pub struct CacheEntriesTraverser<'a> {
    reader: BinaryReader<'a>,
    database_version: u32,
    id_counter: u32,
    primary_id: u32,
    #[debug("{} bytes", shared_inputs.len())]
    shared_inputs: &'a [u8],
    #[debug("{} bytes", shared_log_lines.len())]
    shared_log_lines: &'a [u8],
    entry_count: u16,
    remaining: u16,
}

impl<'a> CacheEntriesTraverser<'a> {
    /// Start traversing a buffer that holds exactly one serialized container.
    pub fn new(bytes: &'a [u8], database_version: u32) -> Result<Self> {
        Self::from_reader(&mut BinaryReader::new(bytes), database_version)
    }

    /// Start traversing at the reader's position. The reader passed in is not
    /// advanced; use [`CacheEntriesTraverser::into_reader`] once done to
    /// continue after the container.
    pub fn from_reader(reader: &BinaryReader<'a>, database_version: u32) -> Result<Self> {
        if !(OLDEST_READABLE_DATABASE_VERSION..=CACHE_DATABASE_VERSION).contains(&database_version) {
            bail!(
                "unsupported database version {database_version} (supported {OLDEST_READABLE_DATABASE_VERSION}..={CACHE_DATABASE_VERSION})"
            );
        }
        let mut reader = reader.clone();
        let id_counter = reader.read_7bit_u32().context("read id counter")?;
        let primary_id = reader.read_7bit_u32().context("read primary id")?;
        let shared_inputs = reader.read_blob().context("read shared inputs")?;
        let shared_log_lines = reader.read_blob().context("read shared log lines")?;
        let entry_count = reader.read_u16().context("read entry count")?;
        Ok(Self {
            reader,
            database_version,
            id_counter,
            primary_id,
            shared_inputs,
            shared_log_lines,
            entry_count,
            remaining: entry_count,
        })
    }

    pub fn id_counter(&self) -> u32 {
        self.id_counter
    }

    pub fn primary_id(&self) -> u32 {
        self.primary_id
    }

    pub fn entry_count(&self) -> u16 {
        self.entry_count
    }

    pub fn shared_inputs(&self) -> &'a [u8] {
        self.shared_inputs
    }

    pub fn shared_log_lines(&self) -> &'a [u8] {
        self.shared_log_lines
    }

    /// The reader positioned after the last entry read so far.
    pub fn into_reader(self) -> BinaryReader<'a> {
        self.reader
    }

    fn read_entry(&mut self) -> Result<EntryView<'a>> {
        let reader = &mut self.reader;
        let id = reader.read_7bit_u32().context("read entry id")?;
        let last_used_time;
        let creation_time;
        if self.database_version >= 3 {
            creation_time = reader.read_7bit().context("read creation time")?;
            last_used_time = reader.read_7bit().context("read last used time")?;
        } else {
            last_used_time = reader.read_7bit().context("read last used time")?;
            creation_time = last_used_time;
        }
        let log_lines_type = reader.read_u8().context("read log lines type")?;
        let log_lines_type = LogLinesType::from_repr(log_lines_type)
            .ok_or_else(|| eyre!("invalid log lines type {log_lines_type}"))?;
        let extra_inputs = reader.read_blob().context("read extra inputs")?;
        let shared_input_ranges = reader.read_blob().context("read shared input ranges")?;
        let outputs = reader.read_blob().context("read outputs")?;
        let log_lines = match log_lines_type {
            LogLinesType::Owned => reader.read_blob().context("read log lines")?,
            LogLinesType::Shared => self.shared_log_lines,
            LogLinesType::Empty => &[],
        };
        Ok(EntryView {
            id,
            creation_time,
            last_used_time,
            log_lines_type,
            shared_inputs: self.shared_inputs,
            shared_input_ranges,
            extra_inputs,
            outputs,
            log_lines,
        })
    }
}

impl<'a> Iterator for CacheEntriesTraverser<'a> {
    type Item = Result<EntryView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let entry = self.read_entry();
        if entry.is_err() {
            self.remaining = 0;
        }
        Some(entry)
    }
}

/// A serialized entry, borrowed from the buffer it was read from.
#[derive(Copy, Clone, Debug)]
pub struct EntryView<'a> {
    pub id: u32,
    pub creation_time: u64,
    pub last_used_time: u64,
    pub log_lines_type: LogLinesType,
    #[debug(skip)]
    shared_inputs: &'a [u8],
    #[debug(skip)]
    shared_input_ranges: &'a [u8],
    #[debug(skip)]
    extra_inputs: &'a [u8],
    #[debug(skip)]
    outputs: &'a [u8],
    #[debug(skip)]
    log_lines: &'a [u8],
}

impl<'a> EntryView<'a> {
    pub fn inputs(&self) -> impl Iterator<Item = u32> + 'a {
        traverse_inputs(self.shared_inputs, self.shared_input_ranges, self.extra_inputs)
    }

    pub fn outputs(&self) -> Varints<'a> {
        Varints::new(self.outputs)
    }

    /// The log blob with the shared case already resolved.
    pub fn log_lines(&self) -> &'a [u8] {
        self.log_lines
    }

    fn to_entry(self) -> CacheEntry {
        CacheEntry {
            id: self.id,
            creation_time: self.creation_time,
            last_used_time: self.last_used_time,
            log_lines_type: self.log_lines_type,
            shared_input_ranges: self.shared_input_ranges.to_vec(),
            extra_inputs: self.extra_inputs.to_vec(),
            outputs: self.outputs.to_vec(),
            log_lines: match self.log_lines_type {
                LogLinesType::Owned => self.log_lines.to_vec(),
                _ => Vec::new(),
            },
        }
    }
}
