//! Node management capability and the per-protocol registry.
//!
//! Every node agent exposes two management calls: a liveness probe and a
//! full-state passage replace. The registry maps each proxy protocol to a
//! constructor for its management transport; it is built once at startup
//! and passed by dependency injection, so tests swap in scripted managers
//! without touching global state.

mod grpc;
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;

pub use grpc::GrpcManager;

use crate::passage::{Argument, Passage, Protocol};
use crate::storage::{BandwidthLimit, Server};

/// Errors from management-channel calls.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// No creator registered for the node's protocol.
    #[error("no manager registered for protocol {0}")]
    UnknownProtocol(String),

    /// The node could not be reached or did not answer in time.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The node answered but refused the call.
    #[error("management call rejected: {0}")]
    Rejected(String),
}

/// Liveness report returned by a node.
#[derive(Debug, Clone, Default)]
pub struct PingReport {
    pub bandwidth: BandwidthLimit,
}

/// Management capability of one node.
///
/// Calls are bounded by caller-supplied timeouts; implementations do not
/// retry internally.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Liveness probe; returns the node's bandwidth accounting.
    async fn ping(&self) -> Result<PingReport, ManagerError>;

    /// Full-state replace of the node's passage set. Idempotent: every
    /// call supersedes the previously pushed set.
    async fn sync_passages(&self, passages: Vec<Passage>) -> Result<(), ManagerError>;
}

impl std::fmt::Debug for dyn Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

/// Dial information for one node's management channel.
#[derive(Debug, Clone)]
pub struct ManageArgument {
    pub host: String,
    pub port: u16,
    pub argument: Argument,
}

impl From<&Server> for ManageArgument {
    fn from(server: &Server) -> Self {
        Self {
            host: server.first_host().to_string(),
            port: server.port,
            argument: server.argument.clone(),
        }
    }
}

/// Constructor for one protocol's management transport.
pub type ManagerCreator = Box<dyn Fn(ManageArgument) -> Box<dyn Manager> + Send + Sync>;

/// Protocol -> manager constructor registry.
#[derive(Default)]
pub struct ManagerRegistry {
    creators: HashMap<Protocol, ManagerCreator>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry speaking the gRPC management channel for every protocol.
    pub fn with_grpc_defaults() -> Self {
        let mut registry = Self::new();
        for protocol in Protocol::ALL {
            registry.register(
                protocol,
                Box::new(|arg| Box::new(GrpcManager::new(&arg)) as Box<dyn Manager>),
            );
        }
        registry
    }

    pub fn register(&mut self, protocol: Protocol, creator: ManagerCreator) {
        self.creators.insert(protocol, creator);
    }

    /// Construct the manager for one node. Construction performs no I/O.
    pub fn create(&self, server: &Server) -> Result<Box<dyn Manager>, ManagerError> {
        let protocol = server.argument.protocol;
        let creator = self
            .creators
            .get(&protocol)
            .ok_or_else(|| ManagerError::UnknownProtocol(protocol.as_str().to_string()))?;
        Ok(creator(ManageArgument::from(server)))
    }
}
