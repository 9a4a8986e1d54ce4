//! gRPC server for the Hawser control plane.

mod control_svc;

pub use control_svc::ControlSvc;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tonic::transport::Server;
use tracing::info;

use hawser_proto::v1::control_service_server::ControlServiceServer;

use crate::config::MaintenanceConfig;
use crate::manager::ManagerRegistry;
use crate::storage::Database;
use crate::sync::SyncScheduler;

/// Errors from server startup and serving.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// gRPC server handle.
pub struct GrpcServer {
    control: ControlSvc,
}

impl GrpcServer {
    pub fn new(
        db: Database,
        registry: Arc<ManagerRegistry>,
        sync: SyncScheduler,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            control: ControlSvc::new(db, registry, sync, config),
        }
    }

    /// Serve on TCP until the shutdown signal fires.
    pub async fn serve_tcp(
        self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<ControlServiceServer<ControlSvc>>()
            .await;

        info!(%addr, "Starting gRPC server on TCP");

        Server::builder()
            .add_service(health_service)
            .add_service(ControlServiceServer::new(self.control))
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .await?;

        Ok(())
    }
}
