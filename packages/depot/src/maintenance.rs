//! Eviction and table compaction.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use humansize::{DECIMAL, format_size};
use protocol::{CacheEntries, CacheEntry, CasKey, CompactCasKeyTable, CompactPathTable, Storage, now_seconds};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::{CacheServer, CacheServerConfig, bucket::Bucket};

const HOUR: u64 = 60 * 60;

/// How close to `bucket_cas_table_max_size` a rebuilt cas table may get
/// before expiration is shortened.
const CAS_TABLE_SIZE_MARGIN: u64 = 2 * 1024 * 1024;

/// What maintenance did to one bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketMaintenance {
    pub removed_entries: usize,
    pub removed_commands: usize,
    pub compacted: bool,

    /// Expiration actually applied after size backpressure.
    pub expiration_time_seconds: u64,
}

impl CacheServer {
    /// Number of threads used for maintenance over `bucket_count` buckets.
    pub fn bucket_worker_count(&self, bucket_count: usize) -> usize {
        bucket_count.min(num_cpus::get()).max(1)
    }

    /// Prune and compact every bucket that saw stores since its last
    /// maintenance (or every bucket when forced), then save what changed.
    ///
    /// `should_exit` is checked before each bucket; a bucket being processed
    /// always finishes. Returns whether any bucket changed.
    #[instrument(name = "CacheServer::run_maintenance", skip(self, should_exit))]
    pub fn run_maintenance(&self, force: bool, should_exit: impl Fn() -> bool + Sync) -> bool {
        let force = force || self.force_maintenance.swap(false, Ordering::AcqRel);
        let buckets = self
            .all_buckets()
            .into_iter()
            .filter(|bucket| force || bucket.adds_since_maintenance() > 0)
            .collect::<Vec<_>>();
        if buckets.is_empty() {
            debug!("nothing to maintain");
            return false;
        }

        let workers = self.bucket_worker_count(buckets.len());
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool,
            Err(err) => {
                warn!(?err, "could not build maintenance pool");
                return false;
            }
        };

        let now = now_seconds();
        let existence = DashMap::new();
        let changed = AtomicBool::new(false);
        pool.install(|| {
            buckets.par_iter().for_each(|bucket| {
                if should_exit() {
                    return;
                }
                match maintain_bucket(bucket, &self.config, self.storage.as_ref(), &existence, now) {
                    Ok(outcome) => {
                        if outcome.removed_entries > 0 || outcome.compacted {
                            changed.store(true, Ordering::Relaxed);
                        }
                    }
                    Err(err) => warn!(bucket = bucket.id, "maintenance failed: {err:#}"),
                }
            })
        });

        if let Err(err) = self.save() {
            warn!("saving after maintenance failed: {err:#}");
        }
        changed.into_inner()
    }
}

/// Run maintenance on one bucket while holding it exclusively.
#[instrument(name = "maintain_bucket", skip_all, fields(bucket = bucket.id))]
pub(crate) fn maintain_bucket(
    bucket: &Bucket,
    config: &CacheServerConfig,
    storage: &dyn Storage,
    existence: &DashMap<CasKey, bool>,
    now: u64,
) -> Result<BucketMaintenance> {
    let _gate = bucket.enter_exclusive();
    let containers = bucket.containers();
    let mut presence = Presence {
        cas_table: &bucket.cas_table,
        storage,
        existence,
        offsets: HashMap::new(),
    };

    let mut expiration = config.expiration_time_seconds;
    let mut removed_entries = 0;
    for (_, container) in &containers {
        removed_entries += container.retain(|entry, shared_inputs| {
            !is_expired(entry, expiration, now)
                && entry.outputs().all(|offset| presence.is_present(offset))
                && (!config.check_inputs_for_deleted_cas
                    || entry.inputs(shared_inputs).all(|offset| presence.is_present(offset)))
        });
        removed_entries += container.truncate(config.entries_per_key_limit());
    }

    let (mut path_table, mut cas_table, remap) = loop {
        let rebuilt = rebuild_tables(bucket, &containers);
        let max = config.bucket_cas_table_max_size;
        let size = u64::from(rebuilt.1.size());
        if max == 0 || size + CAS_TABLE_SIZE_MARGIN < max || expiration <= HOUR {
            break rebuilt;
        }
        expiration -= HOUR;
        debug!(
            cas_table = %format_size(size, DECIMAL),
            expiration,
            "cas table near its limit, shortening expiration"
        );
        for (_, container) in &containers {
            removed_entries += container.retain(|entry, _| !is_expired(entry, expiration, now));
        }
    };

    let compacted = removed_entries > 0
        || path_table.size() != bucket.path_table.size()
        || cas_table.size() != bucket.cas_table.size();
    let mut removed_commands = 0;
    if compacted {
        for (_, container) in &containers {
            removed_entries += container.update_entries(&remap);
        }
        removed_commands = bucket.remove_empty_containers();
        let before = bucket.cas_table.size();
        bucket.path_table.swap(&mut path_table);
        bucket.cas_table.swap(&mut cas_table);
        let generation = bucket.bump_generation();
        bucket.mark_dirty();
        info!(
            removed_entries,
            removed_commands,
            generation,
            cas_table_before = %format_size(before, DECIMAL),
            cas_table_after = %format_size(bucket.cas_table.size(), DECIMAL),
            "bucket compacted"
        );
    }
    bucket.reset_adds();

    Ok(BucketMaintenance {
        removed_entries,
        removed_commands,
        compacted,
        expiration_time_seconds: expiration,
    })
}

fn is_expired(entry: &CacheEntry, expiration: u64, now: u64) -> bool {
    expiration != 0 && now.saturating_sub(entry.last_used_time) > expiration
}

/// Whether the keys behind cas table offsets still exist in storage.
///
/// Results are cached per offset for the bucket and per key across buckets.
/// A missing key invalidates every offset it is registered at.
struct Presence<'a> {
    cas_table: &'a CompactCasKeyTable,
    storage: &'a dyn Storage,
    existence: &'a DashMap<CasKey, bool>,
    offsets: HashMap<u32, bool>,
}

impl Presence<'_> {
    fn is_present(&mut self, offset: u32) -> bool {
        if let Some(present) = self.offsets.get(&offset) {
            return *present;
        }
        let key = match self.cas_table.get_key(offset) {
            Ok(key) => key,
            Err(err) => {
                warn!(offset, "unresolvable cas offset: {err:#}");
                self.offsets.insert(offset, false);
                return false;
            }
        };
        let present = match self.existence.get(&key) {
            Some(present) => *present,
            None => {
                let present = self.storage.exists(&key).unwrap_or_else(|err| {
                    warn!(%key, "checking storage failed, keeping entries: {err:#}");
                    true
                });
                self.existence.insert(key, present);
                present
            }
        };
        if present {
            self.offsets.insert(offset, true);
        } else {
            debug!(%key, "key missing from storage");
            for pair in self.cas_table.traverse_offsets(&key) {
                self.offsets.insert(pair.cas_offset, false);
            }
            self.offsets.insert(offset, false);
        }
        present
    }
}

/// Build fresh tables holding only what the surviving entries reference.
/// Returns the tables and the old to new cas offset mapping.
fn rebuild_tables(
    bucket: &Bucket,
    containers: &[(CasKey, Arc<CacheEntries>)],
) -> (CompactPathTable, CompactCasKeyTable, HashMap<u32, u32>) {
    let mut path_table = CompactPathTable::new(bucket.path_table.case_sensitivity());
    let mut cas_table = CompactCasKeyTable::new();
    let mut remap = HashMap::new();
    let mut path_remap = HashMap::new();

    for (_, container) in containers {
        for entry in container.resolved() {
            for offset in entry.inputs.iter().chain(&entry.outputs) {
                if remap.contains_key(offset) {
                    continue;
                }
                match copy_record(bucket, *offset, &mut path_table, &mut cas_table, &mut path_remap) {
                    Ok(new_offset) => {
                        remap.insert(*offset, new_offset);
                    }
                    Err(err) => warn!(offset, "dropping unresolvable offset: {err:#}"),
                }
            }
        }
    }
    (path_table, cas_table, remap)
}

fn copy_record(
    bucket: &Bucket,
    offset: u32,
    path_table: &mut CompactPathTable,
    cas_table: &mut CompactCasKeyTable,
    path_remap: &mut HashMap<u32, u32>,
) -> Result<u32> {
    let (old_path, key) = bucket.cas_table.get_path_and_key(offset)?;
    let new_path = match path_remap.get(&old_path) {
        Some(new_path) => *new_path,
        None => {
            let path = bucket
                .path_table
                .get_string(old_path)
                .with_context(|| format!("resolve path at {old_path}"))?;
            let (new_path, _) = path_table.add_mut(&path);
            path_remap.insert(old_path, new_path);
            new_path
        }
    };
    Ok(cas_table.add_mut(&key, new_path).0)
}
