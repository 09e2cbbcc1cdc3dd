//! The build cache server.
//!
//! A [`CacheServer`] keeps, per bucket, a path table and a cas key table that
//! every stored entry refers into, plus the entries themselves grouped by
//! command key. Clients push their own tables incrementally and send entries
//! as offsets into them; the server translates those into its bucket tables.
//! Blobs themselves live in a [`Storage`](protocol::Storage) shared by
//! clients and server.
//!
//! Maintenance ([`CacheServer::run_maintenance`]) removes expired entries and
//! entries whose blobs are gone, then rebuilds the tables so they only hold
//! what remaining entries use. Rebuilt tables get a new generation, which
//! tells clients to drop their mirrored copies.

mod bucket;
mod config;
mod in_process;
mod maintenance;
mod persistence;
mod server;

pub use bucket::BucketStatus;
pub use config::{CacheServerConfig, DEFAULT_EXPIRATION_TIME_SECONDS, DEFAULT_MAX_ENTRIES_PER_KEY};
pub use in_process::InProcessClient;
pub use maintenance::BucketMaintenance;
pub use server::{CacheServer, ServerStatus};
