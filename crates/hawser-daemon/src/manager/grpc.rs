//! gRPC management transport.
//!
//! Every protocol variant shares the same management channel: the node
//! agent serves `NodeService` beside its proxy listener and authenticates
//! the control plane by the management credential it registered with. The
//! proxy wire protocols themselves never appear here.

use std::time::Duration;

use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use hawser_proto::v1::node_service_client::NodeServiceClient;
use hawser_proto::v1::{PingRequest, SyncPassagesRequest};

use super::{ManageArgument, Manager, ManagerError, PingReport};
use crate::passage::Passage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Management client for one node, dialed lazily per call.
pub struct GrpcManager {
    endpoint: String,
    token: String,
}

impl GrpcManager {
    pub fn new(arg: &ManageArgument) -> Self {
        Self {
            endpoint: format!("http://{}:{}", arg.host, arg.port),
            token: arg.argument.password.clone(),
        }
    }

    async fn connect(&self) -> Result<NodeServiceClient<Channel>, ManagerError> {
        let endpoint = Channel::from_shared(self.endpoint.clone())
            .map_err(|e| ManagerError::Unreachable(e.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ManagerError::Unreachable(e.to_string()))?;
        Ok(NodeServiceClient::new(channel))
    }

    fn authed<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Ok(value) = format!("Bearer {}", self.token).parse() {
            request.metadata_mut().insert("authorization", value);
        }
        request
    }
}

#[async_trait::async_trait]
impl Manager for GrpcManager {
    async fn ping(&self) -> Result<PingReport, ManagerError> {
        let mut client = self.connect().await?;
        let response = client
            .ping(self.authed(PingRequest {}))
            .await
            .map_err(map_status)?;
        Ok(PingReport {
            bandwidth: response
                .into_inner()
                .bandwidth
                .map(Into::into)
                .unwrap_or_default(),
        })
    }

    async fn sync_passages(&self, passages: Vec<Passage>) -> Result<(), ManagerError> {
        let mut client = self.connect().await?;
        let request = SyncPassagesRequest {
            passages: passages.into_iter().map(Into::into).collect(),
        };
        let response = client
            .sync_passages(self.authed(request))
            .await
            .map_err(map_status)?;
        let status = response.into_inner().status;
        if status == "OK" {
            Ok(())
        } else {
            Err(ManagerError::Rejected(status))
        }
    }
}

fn map_status(status: Status) -> ManagerError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            ManagerError::Unreachable(status.message().to_string())
        }
        _ => ManagerError::Rejected(status.message().to_string()),
    }
}
