//! Server side state for one bucket.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use derive_more::Debug;
use protocol::{
    AddedEntry, CacheEntries, CasKey, CaseSensitivity, CompactCasKeyTable, CompactPathTable,
    binary::BinaryWriter, now_seconds,
};
use serde::Serialize;

/// Server-wide source of table generations.
///
/// Every bucket draws from the same counter, so a generation handed out once
/// is never handed out again while the server runs, even across obliterate.
/// The counter starts at the wall clock and moves past every generation
/// loaded from disk, which keeps it unique across restarts as well.
#[derive(Debug)]
#[debug("Generations({})", self.0.load(Ordering::Relaxed))]
pub(crate) struct Generations(AtomicU32);

impl Generations {
    pub fn new() -> Self {
        let seed = u32::try_from(now_seconds()).unwrap_or(u32::MAX >> 1);
        Self(AtomicU32::new(seed))
    }

    /// A generation no bucket has used yet. Never `0`, which clients use for
    /// "no tables".
    pub fn next(&self) -> u32 {
        loop {
            let generation = self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if generation != 0 {
                return generation;
            }
        }
    }

    /// Record a generation issued by an earlier run.
    pub fn observe(&self, generation: u32) {
        self.0.fetch_max(generation, Ordering::AcqRel);
    }
}

impl Default for Generations {
    fn default() -> Self {
        Self::new()
    }
}

/// Entries and tables for one bucket.
///
/// ## Locking
///
/// `gate` orders normal traffic against maintenance: stores, fetches and
/// usage reports hold it shared, maintenance holds it exclusively for the
/// whole bucket. Below the gate, the command map and each container and
/// table have their own locks, so unrelated commands don't contend.
#[derive(Debug)]
#[debug("Bucket({id})")]
pub(crate) struct Bucket {
    pub id: u32,
    pub path_table: CompactPathTable,
    pub cas_table: CompactCasKeyTable,
    entries: RwLock<HashMap<CasKey, Arc<CacheEntries>>>,
    gate: RwLock<()>,

    /// Replaced whenever the tables are rebuilt; offsets from an older
    /// generation are meaningless.
    generation: AtomicU32,
    generations: Arc<Generations>,
    dirty: AtomicBool,
    adds_since_maintenance: AtomicU64,
}

impl Bucket {
    pub fn new(id: u32, case: CaseSensitivity, generations: Arc<Generations>) -> Self {
        Self::from_parts(
            id,
            CompactPathTable::new(case),
            CompactCasKeyTable::new(),
            HashMap::new(),
            generations,
        )
    }

    pub fn from_parts(
        id: u32,
        path_table: CompactPathTable,
        cas_table: CompactCasKeyTable,
        entries: HashMap<CasKey, Arc<CacheEntries>>,
        generations: Arc<Generations>,
    ) -> Self {
        Self {
            id,
            path_table,
            cas_table,
            entries: RwLock::new(entries),
            gate: RwLock::new(()),
            generation: AtomicU32::new(generations.next()),
            generations,
            dirty: AtomicBool::new(false),
            adds_since_maintenance: AtomicU64::new(0),
        }
    }

    /// Shared access for normal traffic.
    pub fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access for maintenance and persistence of a consistent
    /// snapshot.
    pub fn enter_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Move to a fresh generation after the tables were rebuilt.
    pub fn bump_generation(&self) -> u32 {
        let generation = self.generations.next();
        self.generation.store(generation, Ordering::Release);
        generation
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn adds_since_maintenance(&self) -> u64 {
        self.adds_since_maintenance.load(Ordering::Acquire)
    }

    pub fn reset_adds(&self) {
        self.adds_since_maintenance.store(0, Ordering::Release);
    }

    pub fn container(&self, cmd_key: &CasKey) -> Option<Arc<CacheEntries>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cmd_key)
            .cloned()
    }

    fn container_or_default(&self, cmd_key: &CasKey) -> Arc<CacheEntries> {
        if let Some(container) = self.container(cmd_key) {
            return container;
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*cmd_key)
            .or_default()
            .clone()
    }

    /// Every command and its container, sorted by command key.
    pub fn containers(&self) -> Vec<(CasKey, Arc<CacheEntries>)> {
        let mut containers = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, container)| (*key, container.clone()))
            .collect::<Vec<_>>();
        containers.sort_by_key(|(key, _)| *key);
        containers
    }

    pub fn remove_empty_containers(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, container| !container.is_empty());
        before - entries.len()
    }

    /// Intern a resolved `(path, key)` pair into the bucket tables.
    pub fn intern(&self, path: &str, key: &CasKey) -> u32 {
        let (path_offset, _) = self.path_table.add(path);
        self.cas_table.add(key, path_offset).0
    }

    /// Store an entry whose offsets already refer to this bucket's tables.
    /// The caller holds the gate.
    pub fn commit(
        &self,
        cmd_key: &CasKey,
        inputs: &[u32],
        outputs: &[u32],
        log_lines: Vec<u8>,
        now: u64,
    ) -> AddedEntry {
        let added = self
            .container_or_default(cmd_key)
            .add_entry(inputs, outputs, log_lines, now);
        if let AddedEntry::New(_) = added {
            self.adds_since_maintenance.fetch_add(1, Ordering::AcqRel);
        }
        self.mark_dirty();
        added
    }

    /// Serialized entries for `cmd_key`, empty if none exist. The caller holds
    /// the gate.
    pub fn write_entries(&self, cmd_key: &CasKey) -> Vec<u8> {
        match self.container(cmd_key) {
            Some(container) => {
                let mut writer = BinaryWriter::new();
                container.write(&mut writer);
                writer.into_inner()
            }
            None => Vec::new(),
        }
    }

    pub fn status(&self) -> BucketStatus {
        let containers = self.containers();
        BucketStatus {
            id: self.id,
            generation: self.generation(),
            commands: containers.len(),
            entries: containers.iter().map(|(_, c)| c.len()).sum(),
            path_table_size: self.path_table.size(),
            cas_table_size: self.cas_table.size(),
            cas_keys: self.cas_table.key_count(),
            adds_since_maintenance: self.adds_since_maintenance(),
            dirty: self.is_dirty(),
        }
    }
}

/// Summary of a bucket for the `status` command.
#[derive(Clone, Debug, Serialize)]
pub struct BucketStatus {
    pub id: u32,
    pub generation: u32,
    pub commands: usize,
    pub entries: usize,
    pub path_table_size: u32,
    pub cas_table_size: u32,
    pub cas_keys: usize,
    pub adds_since_maintenance: u64,
    pub dirty: bool,
}
