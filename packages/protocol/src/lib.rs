//! Shared types for the build cache client (`stash`) and server (`depot`).
//!
//! Everything that crosses the wire or lands on disk lives here: content
//! keys, the binary codec, the compact path and key tables, the cache entry
//! layout, and the interfaces to the external storage and transport.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! Like the request types, configuration-ish structs are `#[non_exhaustive]`
//! and constructed through builders so that invariants (for example sorted
//! roots in [`RootPaths`]) can't be bypassed.

pub mod binary;
pub mod cas_key;
pub mod cas_table;
pub mod entry;
pub mod message;
pub mod path_table;
pub mod process;
pub mod root_paths;
pub mod storage;
pub mod transport;

pub use cas_key::CasKey;
pub use cas_table::CompactCasKeyTable;
pub use entry::{AddedEntry, CacheEntries, CacheEntriesTraverser, CacheEntry, EntryView, LogLinesType};
pub use message::{MessageType, WireMessage};
pub use path_table::{CaseSensitivity, CompactPathTable};
pub use process::{LogLineKind, ProcessLogLine, ProcessStartInfo};
pub use root_paths::RootPaths;
pub use storage::{DiskStorage, Storage};
pub use transport::{ConnectionId, NetworkClient, NetworkClientExt, TcpClient};

/// Version of the request/response protocol; exchanged in the connect
/// handshake and must match exactly.
pub const CACHE_NETWORK_VERSION: u32 = 1;

/// Version of the persisted bucket format written by the server.
pub const CACHE_DATABASE_VERSION: u32 = 3;

/// Version of the root path substitution scheme. Hashed into every command
/// key so that changing the scheme never produces false hits.
pub const ROOT_PATHS_VERSION: u32 = 1;

/// Current wall clock time in seconds since the Unix epoch.
pub fn now_seconds() -> u64 {
    u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default()
}
