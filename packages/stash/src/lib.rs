//! The build cache client.
//!
//! A [`CacheClient`] wraps a process invocation: before running it, ask
//! [`CacheClient::fetch_from_cache`] whether a stored result matches the
//! local input files; after running it, hand the inputs, outputs and log
//! to [`CacheClient::write_to_cache`].
//!
//! Paths under registered [`RootPaths`](protocol::RootPaths) are stored
//! root-relative, so checkouts at different locations share entries.

mod client;
mod cmd_key;
mod config;
mod files;

pub use client::{CacheClient, CacheResult, MissReason};
pub use cmd_key::cmd_key;
pub use config::CacheClientConfig;
