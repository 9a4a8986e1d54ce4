//! [`Bucket`] implementations over the two storage tables.

use async_trait::async_trait;

use super::{Bucket, Keyed};
use crate::storage::{Database, DatabaseError, Server, Ticket, upsert_server, upsert_ticket};

/// The `tickets` table as a maintenance bucket.
#[derive(Clone)]
pub struct TicketBucket {
    db: Database,
}

impl TicketBucket {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Bucket for TicketBucket {
    type Record = Ticket;

    fn name(&self) -> &'static str {
        "tickets"
    }

    async fn load_all(&self) -> Result<Vec<Keyed<Ticket>>, DatabaseError> {
        let tickets =
            sqlx::query_as::<_, Ticket>("SELECT * FROM tickets ORDER BY ticket")
                .fetch_all(self.db.pool())
                .await?;
        Ok(tickets
            .into_iter()
            .map(|ticket| Keyed {
                key: ticket.ticket.clone(),
                record: ticket,
            })
            .collect())
    }

    async fn sweep_expired(
        &self,
        is_expired: &(dyn for<'a> Fn(&'a Ticket, i64) -> bool + Send + Sync),
        now: i64,
    ) -> Result<Vec<Keyed<Ticket>>, DatabaseError> {
        let mut tx = self.db.pool().begin().await?;
        let tickets = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets ORDER BY ticket")
            .fetch_all(&mut *tx)
            .await?;
        let mut deleted = Vec::new();
        for ticket in tickets {
            if !is_expired(&ticket, now) {
                continue;
            }
            sqlx::query("DELETE FROM tickets WHERE ticket = ?")
                .bind(&ticket.ticket)
                .execute(&mut *tx)
                .await?;
            deleted.push(Keyed {
                key: ticket.ticket.clone(),
                record: ticket,
            });
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn apply(&self, mutations: Vec<Keyed<Ticket>>) -> Result<(), DatabaseError> {
        let mut tx = self.db.pool().begin().await?;
        for mutation in &mutations {
            upsert_ticket(&mut *tx, &mutation.record).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// The `servers` table as a maintenance bucket.
#[derive(Clone)]
pub struct ServerBucket {
    db: Database,
}

impl ServerBucket {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Bucket for ServerBucket {
    type Record = Server;

    fn name(&self) -> &'static str {
        "servers"
    }

    async fn load_all(&self) -> Result<Vec<Keyed<Server>>, DatabaseError> {
        let servers = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY ticket")
            .fetch_all(self.db.pool())
            .await?;
        Ok(servers
            .into_iter()
            .map(|server| Keyed {
                key: server.ticket.clone(),
                record: server,
            })
            .collect())
    }

    async fn sweep_expired(
        &self,
        is_expired: &(dyn for<'a> Fn(&'a Server, i64) -> bool + Send + Sync),
        now: i64,
    ) -> Result<Vec<Keyed<Server>>, DatabaseError> {
        let mut tx = self.db.pool().begin().await?;
        let servers = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY ticket")
            .fetch_all(&mut *tx)
            .await?;
        let mut deleted = Vec::new();
        for server in servers {
            if !is_expired(&server, now) {
                continue;
            }
            sqlx::query("DELETE FROM servers WHERE ticket = ?")
                .bind(&server.ticket)
                .execute(&mut *tx)
                .await?;
            deleted.push(Keyed {
                key: server.ticket.clone(),
                record: server,
            });
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn apply(&self, mutations: Vec<Keyed<Server>>) -> Result<(), DatabaseError> {
        let mut tx = self.db.pool().begin().await?;
        for mutation in &mutations {
            upsert_server(&mut *tx, &mutation.record).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
