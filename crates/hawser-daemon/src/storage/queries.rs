//! Database queries for the Hawser control plane.

use sqlx::Sqlite;

use super::db::{Database, DatabaseError};
use super::models::{ChatNode, MAX_FAILURE_COUNT, Server, Ticket};

const UPSERT_TICKET_SQL: &str = r"
INSERT OR REPLACE INTO tickets (ticket, chat_identifier, ticket_type, expire_at)
VALUES (?, ?, ?, ?)
";

const UPSERT_SERVER_SQL: &str = r"
INSERT OR REPLACE INTO servers (
    ticket, name, hosts, port, protocol, username, password, method,
    no_relay, failure_count, last_seen, sync_next_seen,
    reset_day, uplink_limit_kib, downlink_limit_kib, total_limit_kib,
    uplink_kib, downlink_kib, uplink_initial_kib, downlink_initial_kib, last_reset
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

/// Upsert one ticket row through any executor (pool or transaction).
pub(crate) async fn upsert_ticket<'e, E>(executor: E, ticket: &Ticket) -> Result<(), DatabaseError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_TICKET_SQL)
        .bind(&ticket.ticket)
        .bind(&ticket.chat_identifier)
        .bind(ticket.ticket_type)
        .bind(ticket.expire_at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Upsert one server row through any executor (pool or transaction).
pub(crate) async fn upsert_server<'e, E>(executor: E, server: &Server) -> Result<(), DatabaseError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(UPSERT_SERVER_SQL)
        .bind(&server.ticket)
        .bind(&server.name)
        .bind(&server.hosts)
        .bind(server.port)
        .bind(server.argument.protocol)
        .bind(&server.argument.username)
        .bind(&server.argument.password)
        .bind(&server.argument.method)
        .bind(server.no_relay)
        .bind(server.failure_count)
        .bind(server.last_seen)
        .bind(server.sync_next_seen)
        .bind(server.bandwidth.reset_day)
        .bind(server.bandwidth.uplink_limit_kib)
        .bind(server.bandwidth.downlink_limit_kib)
        .bind(server.bandwidth.total_limit_kib)
        .bind(server.bandwidth.uplink_kib)
        .bind(server.bandwidth.downlink_kib)
        .bind(server.bandwidth.uplink_initial_kib)
        .bind(server.bandwidth.downlink_initial_kib)
        .bind(server.bandwidth.last_reset)
        .execute(executor)
        .await?;
    Ok(())
}

/// Outcome of a registration, for logging and sync notifications.
#[derive(Debug, Clone, Copy)]
pub struct RegisterOutcome {
    pub first_registration: bool,
    pub reconnected: bool,
    pub info_changed: bool,
}

impl Database {
    // =========================================================================
    // Ticket queries
    // =========================================================================

    /// Insert or replace a ticket.
    pub async fn put_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        upsert_ticket(self.pool(), ticket).await
    }

    /// Get a ticket by id.
    pub async fn get_ticket(&self, ticket: &str) -> Result<Ticket, DatabaseError> {
        sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE ticket = ?")
            .bind(ticket)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Ticket {ticket}")))
    }

    /// Delete a ticket by id.
    pub async fn delete_ticket(&self, ticket: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM tickets WHERE ticket = ?")
            .bind(ticket)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All tickets of one chat, in stable order.
    pub async fn tickets_by_chat(&self, chat_identifier: &str) -> Result<Vec<Ticket>, DatabaseError> {
        let tickets = sqlx::query_as::<_, Ticket>(
            "SELECT * FROM tickets WHERE chat_identifier = ? ORDER BY ticket",
        )
        .bind(chat_identifier)
        .fetch_all(self.pool())
        .await?;
        Ok(tickets)
    }

    /// All chat identifiers with at least one ticket, in stable order.
    pub async fn list_chat_identifiers(&self) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT chat_identifier FROM tickets ORDER BY chat_identifier",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(chat,)| chat).collect())
    }

    /// Delete a ticket together with any server row it keys, atomically.
    ///
    /// No passage cleanup is needed: the resolver stops seeing the ticket
    /// the moment this commits.
    pub async fn revoke_ticket(&self, ticket: &str) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM tickets WHERE ticket = ?")
            .bind(ticket)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM servers WHERE ticket = ?")
            .bind(ticket)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Server queries
    // =========================================================================

    /// Insert or replace a server row.
    pub async fn put_server(&self, server: &Server) -> Result<(), DatabaseError> {
        upsert_server(self.pool(), server).await
    }

    /// Get a node record by its ticket.
    pub async fn get_server(&self, ticket: &str) -> Result<Server, DatabaseError> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE ticket = ?")
            .bind(ticket)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound(format!("Server {ticket}: the node may not be registered"))
            })
    }

    /// Delete a server row by its ticket.
    pub async fn delete_server(&self, ticket: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM servers WHERE ticket = ?")
            .bind(ticket)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Flip the retry-on-next-liveness flag for one node.
    pub async fn set_sync_next_seen(
        &self,
        ticket: &str,
        sync_next_seen: bool,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE servers SET sync_next_seen = ? WHERE ticket = ?")
            .bind(sync_next_seen)
            .bind(ticket)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Server {ticket}")));
        }
        Ok(())
    }

    /// Registered nodes of one chat whose tickets are still live, joined
    /// with the node role, in stable order.
    pub async fn servers_by_chat(
        &self,
        chat_identifier: &str,
        now: i64,
    ) -> Result<Vec<ChatNode>, DatabaseError> {
        let nodes = sqlx::query_as::<_, ChatNode>(
            r"
            SELECT t.ticket_type AS ticket_type, s.*
            FROM servers s
            JOIN tickets t ON t.ticket = s.ticket
            WHERE t.chat_identifier = ?
              AND t.expire_at > ?
              AND t.ticket_type IN ('server', 'relay')
            ORDER BY s.ticket
            ",
        )
        .bind(chat_identifier)
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(nodes)
    }

    /// Persist a (re-)registration, merging bandwidth accounting with the
    /// previous record so cycle baselines survive re-registration.
    ///
    /// `server.bandwidth` carries the node's reported limits and absolute
    /// counters; `failure_count`, `last_seen` and `sync_next_seen` are
    /// overwritten here regardless of what the caller set.
    pub async fn register_server(
        &self,
        mut server: Server,
        now: i64,
    ) -> Result<RegisterOutcome, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let old: Option<Server> = sqlx::query_as("SELECT * FROM servers WHERE ticket = ?")
            .bind(&server.ticket)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match &old {
            None => {
                // First sighting: the billing cycle starts now.
                server.bandwidth.reset(now);
                RegisterOutcome {
                    first_registration: true,
                    reconnected: false,
                    info_changed: false,
                }
            }
            Some(old) => {
                let info_changed = old.argument != server.argument
                    || old.hosts != server.hosts
                    || old.port != server.port;
                let reconnected = old.failure_count >= MAX_FAILURE_COUNT;
                let mut bandwidth = old.bandwidth.clone();
                bandwidth.update(&server.bandwidth);
                server.bandwidth = bandwidth;
                RegisterOutcome {
                    first_registration: false,
                    reconnected,
                    info_changed,
                }
            }
        };

        server.failure_count = 0;
        server.last_seen = now;
        server.sync_next_seen = false;

        upsert_server(&mut *tx, &server).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}
