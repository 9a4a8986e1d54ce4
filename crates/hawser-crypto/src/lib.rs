//! Credential derivation primitives for Hawser.
//!
//! Per-relationship node credentials are one-way derivations of the ticket
//! strings involved, so nothing secret is ever persisted: deleting a ticket
//! is enough to revoke every credential derived from it.

pub mod derive;
pub mod ticket;

pub use derive::{DERIVED_PASSWORD_LEN, derive_password, derive_uuid};
pub use ticket::{TICKET_LENGTH, generate_ticket};
