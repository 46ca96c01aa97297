//! Stabilizer - a reverse proxy for HTTP backends whose workers hang
//!
//! This library fronts a pool of identical worker subprocesses and keeps the
//! service responsive even when individual workers wedge themselves:
//! - Spawns and supervises N workers, each in its own process group
//! - Bounds per-worker concurrency by publishing C admission slots per worker
//! - Enforces a per-request deadline (overridable via a request header)
//! - Kills and respawns any worker that misses its deadline, grand-children
//!   included
//! - Counts timeout-driven restarts and exposes them for Prometheus

pub mod cli;
pub mod demo;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod supervisor;
pub mod worker;
