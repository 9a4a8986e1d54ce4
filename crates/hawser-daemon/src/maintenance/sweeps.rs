//! Expiry sweeps: expired tickets and retired nodes.
//!
//! Both are instances of [`super::spawn_expire_sweep`]. Deleting a user
//! ticket implicitly revokes its passages, so every affected chat gets a
//! follow-up sync; a retired node additionally takes its ticket with it.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Keyed, ServerBucket, TicketBucket, spawn_expire_sweep};
use crate::config::MaintenanceConfig;
use crate::storage::{Database, Server, Ticket};
use crate::sync::{self, SyncScheduler};

/// Sweep tickets past their expiry. Server/relay tickets carry the
/// far-future sentinel, so in practice this removes user tickets.
pub fn spawn_ticket_sweep(
    db: Database,
    sync: SyncScheduler,
    config: &MaintenanceConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let bucket = TicketBucket::new(db.clone());
    spawn_expire_sweep(
        bucket,
        config.sweep_interval(),
        |ticket: &Ticket, now| ticket.expired(now),
        move |deleted| {
            let db = db.clone();
            let sync = sync.clone();
            async move {
                let mut chats: Vec<String> = deleted
                    .into_iter()
                    .map(|keyed| keyed.record.chat_identifier)
                    .collect();
                chats.sort_unstable();
                chats.dedup();
                for chat in chats {
                    if let Err(e) = sync::request_chat_sync(&db, &sync, &chat).await {
                        warn!(chat = %chat, error = %e, "Cannot request chat sync");
                    }
                }
            }
        },
        shutdown,
    )
}

/// Sweep nodes that are down and unseen past the retirement window.
pub fn spawn_node_retirement(
    db: Database,
    sync: SyncScheduler,
    config: &MaintenanceConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let bucket = ServerBucket::new(db.clone());
    let retire_after = config.retire_after();
    spawn_expire_sweep(
        bucket,
        config.sweep_interval(),
        move |server: &Server, now| server.is_down() && now - server.last_seen >= retire_after,
        move |deleted| {
            let db = db.clone();
            let sync = sync.clone();
            async move {
                for node in deleted {
                    retire_node(&db, &sync, &node).await;
                }
            }
        },
        shutdown,
    )
}

async fn retire_node(db: &Database, sync: &SyncScheduler, node: &Keyed<Server>) {
    // The ticket goes with the node, and its chat learns about the removal.
    match db.get_ticket(&node.key).await {
        Ok(ticket) => {
            if let Err(e) = db.delete_ticket(&node.key).await {
                warn!(ticket = %node.key, error = %e, "Cannot delete retired node's ticket");
                return;
            }
            info!(node = %node.record.name, "Retired node removed");
            if let Err(e) = sync::request_chat_sync(db, sync, &ticket.chat_identifier).await {
                warn!(chat = %ticket.chat_identifier, error = %e, "Cannot request chat sync");
            }
        }
        Err(e) => warn!(ticket = %node.key, error = %e, "Retired node had no ticket"),
    }
}
