//! Ticket lifecycle: issue, renew, revoke.
//!
//! Verification of who may obtain a ticket (blind signatures, bot flows)
//! happens in front of the control plane; these operations only manage the
//! stored records and leave sync fan-out to the caller.

use chrono::{DateTime, Months, Utc};

use hawser_crypto::generate_ticket;

use crate::storage::{Database, DatabaseError, NEVER_EXPIRES, Ticket, TicketType};

/// Errors from ticket operations.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("ticket already exists")]
    AlreadyExists,

    #[error("only user tickets can be renewed")]
    NotRenewable,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Expiry for a fresh or renewed user ticket: one calendar month out.
fn user_expiry(now: i64) -> i64 {
    DateTime::<Utc>::from_timestamp(now, 0)
        .and_then(|at| at.checked_add_months(Months::new(1)))
        .map_or(now + 30 * 86_400, |at| at.timestamp())
}

/// Create a ticket. Server/relay tickets never expire on their own; user
/// tickets get a one-month TTL. The id is generated unless supplied.
pub async fn issue_ticket(
    db: &Database,
    chat_identifier: &str,
    ticket_type: TicketType,
    explicit_id: Option<String>,
    now: i64,
) -> Result<Ticket, TicketError> {
    let id = explicit_id.unwrap_or_else(generate_ticket);
    match db.get_ticket(&id).await {
        Ok(_) => return Err(TicketError::AlreadyExists),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let expire_at = match ticket_type {
        TicketType::User => user_expiry(now),
        TicketType::Server | TicketType::Relay => NEVER_EXPIRES,
    };
    let ticket = Ticket {
        ticket: id,
        chat_identifier: chat_identifier.to_string(),
        ticket_type,
        expire_at,
    };
    db.put_ticket(&ticket).await?;
    Ok(ticket)
}

/// Extend a user ticket by one month from `now`. The id stays the same,
/// so every credential derived from it stays valid.
pub async fn renew_ticket(db: &Database, ticket_id: &str, now: i64) -> Result<Ticket, TicketError> {
    let mut ticket = db.get_ticket(ticket_id).await?;
    if ticket.ticket_type != TicketType::User {
        return Err(TicketError::NotRenewable);
    }
    ticket.expire_at = user_expiry(now);
    db.put_ticket(&ticket).await?;
    Ok(ticket)
}

/// Delete a ticket and any server row it keys, atomically. Returns the
/// removed ticket so the caller can fan out a chat sync.
pub async fn revoke_ticket(db: &Database, ticket_id: &str) -> Result<Ticket, TicketError> {
    let ticket = db.get_ticket(ticket_id).await?;
    db.revoke_ticket(ticket_id).await?;
    Ok(ticket)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::passage::{Argument, Protocol};
    use crate::storage::{BandwidthLimit, Server};

    const NOW: i64 = 1_700_000_000;

    #[tokio::test]
    async fn issue_generates_an_id_and_sets_ttl() {
        let db = Database::open_in_memory().await.unwrap();
        let ticket = issue_ticket(&db, "chat-a", TicketType::User, None, NOW)
            .await
            .unwrap();

        assert_eq!(ticket.ticket.len(), hawser_crypto::TICKET_LENGTH);
        assert!(ticket.expire_at > NOW + 27 * 86_400);
        assert!(ticket.expire_at < NOW + 32 * 86_400);
        assert!(db.get_ticket(&ticket.ticket).await.is_ok());
    }

    #[tokio::test]
    async fn node_tickets_never_expire() {
        let db = Database::open_in_memory().await.unwrap();
        for ticket_type in [TicketType::Server, TicketType::Relay] {
            let ticket = issue_ticket(&db, "chat-a", ticket_type, None, NOW)
                .await
                .unwrap();
            assert_eq!(ticket.expire_at, NEVER_EXPIRES);
        }
    }

    #[tokio::test]
    async fn issue_rejects_duplicate_ids() {
        let db = Database::open_in_memory().await.unwrap();
        issue_ticket(&db, "chat-a", TicketType::User, Some("dup".into()), NOW)
            .await
            .unwrap();
        let err = issue_ticket(&db, "chat-b", TicketType::Server, Some("dup".into()), NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::AlreadyExists));
    }

    #[tokio::test]
    async fn renew_extends_user_tickets_only() {
        let db = Database::open_in_memory().await.unwrap();
        let user = issue_ticket(&db, "chat-a", TicketType::User, None, NOW)
            .await
            .unwrap();
        let renewed = renew_ticket(&db, &user.ticket, NOW + 86_400).await.unwrap();
        assert!(renewed.expire_at > user.expire_at);

        let node = issue_ticket(&db, "chat-a", TicketType::Relay, None, NOW)
            .await
            .unwrap();
        let err = renew_ticket(&db, &node.ticket, NOW).await.unwrap_err();
        assert!(matches!(err, TicketError::NotRenewable));
    }

    #[tokio::test]
    async fn revoke_removes_ticket_and_server() {
        let db = Database::open_in_memory().await.unwrap();
        let ticket = issue_ticket(&db, "chat-a", TicketType::Server, None, NOW)
            .await
            .unwrap();
        db.put_server(&Server {
            ticket: ticket.ticket.clone(),
            name: "node-1".into(),
            hosts: "192.0.2.1".into(),
            port: 443,
            argument: Argument::management(Protocol::Shadowsocks, "", "pw"),
            no_relay: false,
            failure_count: 0,
            last_seen: 0,
            sync_next_seen: false,
            bandwidth: BandwidthLimit::default(),
        })
        .await
        .unwrap();

        let removed = revoke_ticket(&db, &ticket.ticket).await.unwrap();
        assert_eq!(removed.chat_identifier, "chat-a");
        assert!(db.get_ticket(&ticket.ticket).await.unwrap_err().is_not_found());
        assert!(db.get_server(&ticket.ticket).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn revoking_a_missing_ticket_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let err = revoke_ticket(&db, "nope").await.unwrap_err();
        assert!(matches!(err, TicketError::Database(e) if e.is_not_found()));
    }
}
