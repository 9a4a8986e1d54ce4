//! `ControlService` gRPC implementation: node registration and the ticket
//! lifecycle.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use hawser_core::db::unix_timestamp;
use hawser_proto::v1::control_service_server::ControlService;
use hawser_proto::v1::{
    GetPassagesRequest, GetPassagesResponse, IssueTicketRequest, RegisterNodeRequest,
    RegisterNodeResponse, RenewTicketRequest, RevokeTicketRequest, RevokeTicketResponse,
    TicketReply,
};

use crate::config::MaintenanceConfig;
use crate::manager::ManagerRegistry;
use crate::passage::{Argument, resolver};
use crate::storage::{Database, DatabaseError, Server, TicketType};
use crate::sync::{self, SyncScheduler};
use crate::tickets::{self, TicketError};

/// `ControlService` implementation.
pub struct ControlSvc {
    db: Database,
    registry: Arc<ManagerRegistry>,
    sync: SyncScheduler,
    config: MaintenanceConfig,
}

impl ControlSvc {
    pub const fn new(
        db: Database,
        registry: Arc<ManagerRegistry>,
        sync: SyncScheduler,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            db,
            registry,
            sync,
            config,
        }
    }

    /// Validate the registration request into a server record.
    fn server_from_request(req: RegisterNodeRequest, now: i64) -> Result<Server, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let hosts = req.hosts.trim();
        if hosts.is_empty() || hosts.split(',').any(|host| host.trim().is_empty()) {
            return Err(Status::invalid_argument("hosts must be a non-empty list"));
        }
        let port = u16::try_from(req.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| Status::invalid_argument("port is out of range"))?;
        let argument: Argument = req
            .argument
            .ok_or_else(|| Status::invalid_argument("management argument is required"))?
            .try_into()
            .map_err(|_| Status::invalid_argument("protocol is missing or unspecified"))?;

        Ok(Server {
            ticket: req.ticket,
            name: req.name,
            hosts: hosts.to_string(),
            port,
            argument,
            no_relay: req.no_relay,
            failure_count: 0,
            last_seen: now,
            sync_next_seen: false,
            bandwidth: req.bandwidth.map(Into::into).unwrap_or_default(),
        })
    }

    async fn fan_out_chat(&self, chat_identifier: &str) {
        if let Err(e) = sync::request_chat_sync(&self.db, &self.sync, chat_identifier).await {
            warn!(chat = chat_identifier, error = %e, "Cannot request chat sync");
        }
    }
}

#[tonic::async_trait]
impl ControlService for ControlSvc {
    #[instrument(skip(self, request), fields(rpc = "RegisterNode"))]
    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let req = request.into_inner();
        let now = unix_timestamp();

        let ticket = self.db.get_ticket(&req.ticket).await.map_err(db_status)?;
        if ticket.expired(now) {
            return Err(Status::permission_denied("ticket expired"));
        }
        if ticket.ticket_type == TicketType::User {
            return Err(Status::invalid_argument("not a node ticket"));
        }

        let server = Self::server_from_request(req, now)?;

        // Reachability check before the record lands in the store.
        let manager = self
            .registry
            .create(&server)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        match tokio::time::timeout(self.config.ping_timeout(), manager.ping()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(Status::unavailable(format!("node unreachable: {e}"))),
            Err(_) => return Err(Status::unavailable("node unreachable: ping timed out")),
        }

        let name = server.name.clone();
        let node_ticket = server.ticket.clone();
        let outcome = self
            .db
            .register_server(server, now)
            .await
            .map_err(db_status)?;
        if outcome.first_registration {
            info!(node = %name, chat = %ticket.chat_identifier, "Node launched");
        } else if outcome.reconnected {
            info!(node = %name, "Node reconnected");
        } else if outcome.info_changed {
            info!(node = %name, "Node info changed");
        }

        if let Err(e) = sync::request_node_sync(&self.db, &self.sync, &node_ticket).await {
            warn!(node = %name, error = %e, "Cannot request node sync");
        }

        let passages = match resolver::passages_for_node(&self.db, &node_ticket, now).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!(node = %name, error = %e, "Cannot resolve passages for reply");
                Vec::new()
            }
        };
        Ok(Response::new(RegisterNodeResponse {
            passages: passages.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "IssueTicket"))]
    async fn issue_ticket(
        &self,
        request: Request<IssueTicketRequest>,
    ) -> Result<Response<TicketReply>, Status> {
        let req = request.into_inner();
        if req.chat_identifier.is_empty() {
            return Err(Status::invalid_argument("chat_identifier is required"));
        }
        let ticket_type = ticket_type_from_proto(req.ticket_type)
            .ok_or_else(|| Status::invalid_argument("ticket_type is required"))?;
        let explicit_id = (!req.ticket.is_empty()).then_some(req.ticket);

        let ticket = tickets::issue_ticket(
            &self.db,
            &req.chat_identifier,
            ticket_type,
            explicit_id,
            unix_timestamp(),
        )
        .await
        .map_err(ticket_status)?;

        self.fan_out_chat(&ticket.chat_identifier).await;
        Ok(Response::new(TicketReply {
            ticket: ticket.ticket,
            expire_at: ticket.expire_at,
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "RenewTicket"))]
    async fn renew_ticket(
        &self,
        request: Request<RenewTicketRequest>,
    ) -> Result<Response<TicketReply>, Status> {
        let req = request.into_inner();
        let ticket = tickets::renew_ticket(&self.db, &req.ticket, unix_timestamp())
            .await
            .map_err(ticket_status)?;

        self.fan_out_chat(&ticket.chat_identifier).await;
        Ok(Response::new(TicketReply {
            ticket: ticket.ticket,
            expire_at: ticket.expire_at,
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "RevokeTicket"))]
    async fn revoke_ticket(
        &self,
        request: Request<RevokeTicketRequest>,
    ) -> Result<Response<RevokeTicketResponse>, Status> {
        let req = request.into_inner();
        let ticket = tickets::revoke_ticket(&self.db, &req.ticket)
            .await
            .map_err(ticket_status)?;
        info!(chat = %ticket.chat_identifier, ticket_type = %ticket.ticket_type, "Ticket revoked");

        self.fan_out_chat(&ticket.chat_identifier).await;
        Ok(Response::new(RevokeTicketResponse {}))
    }

    #[instrument(skip(self, request), fields(rpc = "GetPassages"))]
    async fn get_passages(
        &self,
        request: Request<GetPassagesRequest>,
    ) -> Result<Response<GetPassagesResponse>, Status> {
        let req = request.into_inner();
        let passages = resolver::passages_for_node(&self.db, &req.ticket, unix_timestamp())
            .await
            .map_err(db_status)?;
        Ok(Response::new(GetPassagesResponse {
            passages: passages.into_iter().map(Into::into).collect(),
        }))
    }
}

fn ticket_type_from_proto(value: i32) -> Option<TicketType> {
    match hawser_proto::v1::TicketType::try_from(value) {
        Ok(hawser_proto::v1::TicketType::User) => Some(TicketType::User),
        Ok(hawser_proto::v1::TicketType::Server) => Some(TicketType::Server),
        Ok(hawser_proto::v1::TicketType::Relay) => Some(TicketType::Relay),
        Ok(hawser_proto::v1::TicketType::Unspecified) | Err(_) => None,
    }
}

fn db_status(e: DatabaseError) -> Status {
    if e.is_not_found() {
        Status::not_found(e.to_string())
    } else {
        Status::internal(e.to_string())
    }
}

fn ticket_status(e: TicketError) -> Status {
    match e {
        TicketError::AlreadyExists => Status::already_exists(e.to_string()),
        TicketError::NotRenewable => Status::failed_precondition(e.to_string()),
        TicketError::Database(db) => db_status(db),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::manager::ManagerError;
    use crate::manager::mock::MockFleet;
    use crate::passage::Protocol;

    async fn test_service() -> (ControlSvc, Arc<MockFleet>, Database) {
        let db = Database::open_in_memory().await.unwrap();
        let (fleet, _events) = MockFleet::new();
        let mut registry = ManagerRegistry::new();
        registry.register(Protocol::Shadowsocks, fleet.creator());
        let registry = Arc::new(registry);
        let sync = SyncScheduler::new(db.clone(), Arc::clone(&registry), SyncConfig::default());
        let config = MaintenanceConfig {
            ping_timeout_secs: 1,
            ..MaintenanceConfig::default()
        };
        let svc = ControlSvc::new(db.clone(), registry, sync, config);
        (svc, fleet, db)
    }

    fn register_request(ticket: &str) -> Request<RegisterNodeRequest> {
        Request::new(RegisterNodeRequest {
            ticket: ticket.to_string(),
            name: "node-1".to_string(),
            hosts: "192.0.2.10".to_string(),
            port: 8388,
            argument: Some(hawser_proto::v1::Argument {
                protocol: hawser_proto::v1::Protocol::Shadowsocks.into(),
                username: String::new(),
                password: "mgmt-pw".to_string(),
                method: "chacha20-ietf-poly1305".to_string(),
            }),
            bandwidth: None,
            no_relay: false,
        })
    }

    async fn issue(svc: &ControlSvc, chat: &str, ticket_type: hawser_proto::v1::TicketType) -> String {
        svc.issue_ticket(Request::new(IssueTicketRequest {
            chat_identifier: chat.to_string(),
            ticket_type: ticket_type.into(),
            ticket: String::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .ticket
    }

    #[tokio::test]
    async fn register_persists_a_reachable_node() {
        let (svc, _fleet, db) = test_service().await;
        let ticket = issue(&svc, "chat-a", hawser_proto::v1::TicketType::Server).await;

        let response = svc.register_node(register_request(&ticket)).await.unwrap();
        assert!(response.into_inner().passages.is_empty());

        let server = db.get_server(&ticket).await.unwrap();
        assert_eq!(server.name, "node-1");
        assert_eq!(server.failure_count, 0);
    }

    #[tokio::test]
    async fn register_rejects_unreachable_nodes() {
        let (svc, fleet, db) = test_service().await;
        let ticket = issue(&svc, "chat-a", hawser_proto::v1::TicketType::Server).await;
        fleet.script_ping(
            "192.0.2.10",
            Err(ManagerError::Unreachable("connection refused".into())),
        );

        let status = svc
            .register_node(register_request(&ticket))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(db.get_server(&ticket).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn register_rejects_user_tickets() {
        let (svc, _fleet, _db) = test_service().await;
        let ticket = issue(&svc, "chat-a", hawser_proto::v1::TicketType::User).await;

        let status = svc
            .register_node(register_request(&ticket))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn register_rejects_unknown_tickets() {
        let (svc, _fleet, _db) = test_service().await;
        let status = svc
            .register_node(register_request("no-such-ticket"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn register_returns_passages_for_live_users() {
        let (svc, _fleet, _db) = test_service().await;
        let server_ticket = issue(&svc, "chat-a", hawser_proto::v1::TicketType::Server).await;
        let _user = issue(&svc, "chat-a", hawser_proto::v1::TicketType::User).await;

        let response = svc
            .register_node(register_request(&server_ticket))
            .await
            .unwrap();
        assert_eq!(response.into_inner().passages.len(), 1);
    }

    #[tokio::test]
    async fn revoke_makes_the_ticket_unknown() {
        let (svc, _fleet, db) = test_service().await;
        let ticket = issue(&svc, "chat-a", hawser_proto::v1::TicketType::User).await;

        svc.revoke_ticket(Request::new(RevokeTicketRequest {
            ticket: ticket.clone(),
        }))
        .await
        .unwrap();
        assert!(db.get_ticket(&ticket).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn issue_rejects_unspecified_type() {
        let (svc, _fleet, _db) = test_service().await;
        let status = svc
            .issue_ticket(Request::new(IssueTicketRequest {
                chat_identifier: "chat-a".to_string(),
                ticket_type: hawser_proto::v1::TicketType::Unspecified.into(),
                ticket: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
