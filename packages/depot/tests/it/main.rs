//! Integration tests for the depot cache server.
//!
//! These drive the server through [`depot::InProcessClient`] with raw
//! protocol requests, the same messages a `stash` client sends.

mod admin;
mod helpers;
mod maintenance;
mod persistence;
mod store;

pub use helpers::*;
