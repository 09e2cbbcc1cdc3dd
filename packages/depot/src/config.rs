//! Server configuration.

use std::path::PathBuf;

use bon::Builder;
use protocol::{CaseSensitivity, entry::MAX_ENTRIES};

/// Three days.
pub const DEFAULT_EXPIRATION_TIME_SECONDS: u64 = 3 * 24 * 60 * 60;

pub const DEFAULT_MAX_ENTRIES_PER_KEY: usize = 128;

/// Policy and location of a [`CacheServer`](crate::CacheServer).
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct CacheServerConfig {
    /// Directory holding the persisted buckets.
    #[builder(into)]
    pub root_dir: PathBuf,

    /// Entries not used for longer than this are removed by maintenance.
    /// `0` disables age based removal.
    #[builder(default = DEFAULT_EXPIRATION_TIME_SECONDS)]
    pub expiration_time_seconds: u64,

    /// Soft limit on the size of a bucket's cas key table in bytes. When a
    /// bucket gets close, maintenance shortens the expiration time for that
    /// bucket one hour at a time until it fits. `0` means unlimited.
    #[builder(default)]
    pub bucket_cas_table_max_size: u64,

    /// Most entries kept per command key; the least recently used are
    /// dropped first. `0` means as many as a container can hold, see
    /// [`CacheServerConfig::entries_per_key_limit`].
    #[builder(default = DEFAULT_MAX_ENTRIES_PER_KEY)]
    pub max_entries_per_key: usize,

    /// Also drop entries whose inputs are gone from storage. Outputs are
    /// always checked.
    #[builder(default)]
    pub check_inputs_for_deleted_cas: bool,

    /// Delete the persisted buckets instead of loading them.
    #[builder(default)]
    pub wipe_on_load: bool,

    #[builder(default)]
    pub case_sensitivity: CaseSensitivity,
}

impl CacheServerConfig {
    /// The per command cap maintenance enforces, never above what a
    /// container can persist.
    pub fn entries_per_key_limit(&self) -> usize {
        match self.max_entries_per_key {
            0 => MAX_ENTRIES,
            max => max.min(MAX_ENTRIES),
        }
    }
}
