//! Core library for Hawser.
//!
//! Shared plumbing used by the daemon crates: `SQLite` pool helpers and
//! `DatabaseError`, unix-timestamp helpers, and tracing initialisation.

pub mod db;
pub mod tracing_init;
