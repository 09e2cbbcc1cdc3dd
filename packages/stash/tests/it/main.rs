//! Integration tests for the stash cache client.
//!
//! Each test runs a real [`depot::CacheServer`] in process and points
//! clients at it through [`depot::InProcessClient`], with local files and
//! storage in temporary directories.

mod admin;
mod roots;
mod store;

pub use helpers::*;
