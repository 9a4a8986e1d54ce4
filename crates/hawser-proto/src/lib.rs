//! Hawser Protocol Buffers
//!
//! Generated protobuf code for the Hawser gRPC API.
//!
//! This crate contains:
//! - `NodeService` -- the management channel implemented by node agents
//!   (the control plane is the client)
//! - `ControlService` -- registration and ticket lifecycle, served by the
//!   control-plane daemon

#![allow(clippy::derive_partial_eq_without_eq)]

/// Hawser v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("hawser.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;
