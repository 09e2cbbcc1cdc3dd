//! Client configuration.

use bon::Builder;

/// Behavior of a [`CacheClient`](crate::CacheClient).
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct CacheClientConfig {
    /// Name sent in the connect handshake; shows up in server logs.
    #[builder(default = String::from("stash"), into)]
    pub client_name: String,

    /// When false every fetch is reported as a miss. Stores still happen.
    #[builder(default = true)]
    pub use_cache_hit: bool,

    /// Explain misses in [`CacheResult::miss_reason`](crate::CacheResult).
    #[builder(default)]
    pub report_miss_reason: bool,

    /// Re-hash every input right before storing. A file that changed since
    /// it was first hashed was modified during the build, so nothing is
    /// stored.
    #[builder(default)]
    pub validate_cache_writes_input: bool,

    /// Read every uploaded output back from storage and verify its key
    /// before committing the entry.
    #[builder(default)]
    pub validate_cache_writes_output: bool,

    /// Extensions (without the dot) of files whose content embeds absolute
    /// paths. Such files have registered roots replaced in their content
    /// before hashing and uploading, and restored when materialized.
    #[builder(default, into)]
    pub normalize_extensions: Vec<String>,
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
