//! Hawser Control-Plane Daemon Library
//!
//! Core functionality for the Hawser daemon:
//! - `SQLite` storage for tickets and node records
//! - Passage resolution (per-relationship credential derivation)
//! - Sync scheduling with coalescing and cancellation
//! - Periodic maintenance (liveness pings, expiry sweeps)
//! - gRPC control surface for registration and ticket lifecycle

pub mod config;
pub mod maintenance;
pub mod manager;
pub mod passage;
pub mod server;
pub mod storage;
pub mod sync;
pub mod tickets;
