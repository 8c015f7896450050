//! `gist_core`: the feed-aggregation backbone — Anubis-style challenge
//! solving, the on-disk SQLite schema and its migrations, ID generation,
//! the outbound network client factory, and the refresh scheduler.
//!
//! The binaries in `src/bin/` that predate this crate (the bare solver CLI
//! and the solve-as-a-proxy tool) remain as standalone debugging utilities
//! against arbitrary hosts; `gistd` is the aggregator daemon built on top
//! of the modules below.

pub mod challenge;
pub mod config;
pub mod id;
pub mod net;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod util;
