//! `SQLite` storage for the Hawser control plane.
//!
//! Two ticket-keyed tables ("buckets"): `tickets` and `servers`. All access
//! goes through short-lived reads or transactions on the WAL-mode pool, so
//! concurrent readers never block each other and writers are serialized.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::{
    BandwidthLimit, ChatNode, MAX_FAILURE_COUNT, NEVER_EXPIRES, Server, Ticket, TicketType,
};
pub use queries::RegisterOutcome;

pub(crate) use queries::{upsert_server, upsert_ticket};
