//! Push scheduler ("sync box").
//!
//! Guarantees at most one effective, up-to-date push per node: requests
//! coalesce into a single-slot pending flag, a request arriving while a
//! push runs cancels it, and each drained batch is followed by a short
//! quiescence interval so bursts (bulk revokes, chat-wide changes) fold
//! into one follow-up round.
//!
//! Per node: `Idle -> Queued -> Running -> {Idle | Queued}`. Which push
//! owns the final `sync_next_seen` write is decided by a monotonic
//! generation counter: a superseded push discards its outcome entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hawser_core::db::unix_timestamp;

use crate::config::SyncConfig;
use crate::manager::ManagerRegistry;
use crate::passage::resolver;
use crate::storage::{Database, DatabaseError};

/// Terminal state of one push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    /// Passages delivered; clear the retry flag.
    Synced,
    /// Network or node failure; retry when the node is next seen alive.
    Failed,
    /// Superseded by a newer request; owns nothing.
    Canceled,
    /// Nothing to push (node unknown or unresolvable); no flag change.
    Skipped,
}

#[derive(Default)]
struct NodeSlot {
    pending: bool,
    /// Bumped when a push starts; a push whose generation no longer
    /// matches has been superseded.
    generation: u64,
    cancel: Option<CancellationToken>,
    last_activity: Option<Instant>,
}

struct SyncInner {
    db: Database,
    registry: Arc<ManagerRegistry>,
    config: SyncConfig,
    slots: Mutex<HashMap<String, NodeSlot>>,
    wake: Notify,
}

/// Cloneable handle to the scheduler; all clones share one slot map.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SyncInner>,
}

impl SyncScheduler {
    pub fn new(db: Database, registry: Arc<ManagerRegistry>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                db,
                registry,
                config,
                slots: Mutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    /// Request a push for one node.
    ///
    /// Returns immediately and never blocks on I/O. A push already running
    /// for this node is cancelled; whichever attempt finishes, the state
    /// will be re-pushed anyway.
    pub fn req_sync(&self, node_ticket: &str) {
        {
            let mut slots = self.lock_slots();
            let slot = slots.entry(node_ticket.to_string()).or_default();
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
            slot.pending = true;
        }
        self.inner.wake.notify_one();
    }

    /// Run the sync loop until shutdown.
    ///
    /// Blocks on the wake signal, drains every pending slot as one batch
    /// of concurrent pushes, waits for the batch, then settles for the
    /// quiescence interval before listening again. Requests arriving
    /// mid-batch re-arm the wake signal, so nothing is lost.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = self.inner.wake.notified() => {}
                _ = shutdown.changed() => return,
            }

            let batch = self.take_pending();
            if batch.is_empty() {
                continue;
            }
            debug!(nodes = batch.len(), "Sync batch starting");

            join_all(batch.into_iter().map(|(ticket, generation, cancel)| {
                let scheduler = self.clone();
                async move { scheduler.push(&ticket, generation, &cancel).await }
            }))
            .await;

            tokio::select! {
                () = tokio::time::sleep(self.inner.config.quiesce()) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Periodically drop slots idle past the expiry window, bounding
    /// memory for permanently retired nodes.
    pub async fn run_cleaner(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.inner.config.clean_interval());
        timer.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let expiry = self.inner.config.slot_expiry();
                    let mut slots = self.lock_slots();
                    slots.retain(|_, slot| {
                        slot.pending
                            || slot.cancel.is_some()
                            || slot.last_activity.is_none_or(|at| at.elapsed() < expiry)
                    });
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Number of tracked node slots (cleaner observability and tests).
    pub fn slot_count(&self) -> usize {
        self.lock_slots().len()
    }

    fn take_pending(&self) -> Vec<(String, u64, CancellationToken)> {
        let mut slots = self.lock_slots();
        let mut batch = Vec::new();
        for (ticket, slot) in slots.iter_mut() {
            if !slot.pending {
                continue;
            }
            slot.pending = false;
            slot.generation += 1;
            let cancel = CancellationToken::new();
            slot.cancel = Some(cancel.clone());
            slot.last_activity = Some(Instant::now());
            batch.push((ticket.clone(), slot.generation, cancel));
        }
        batch
    }

    async fn push(&self, ticket: &str, generation: u64, cancel: &CancellationToken) {
        let outcome = self.push_inner(ticket, cancel).await;

        // Ownership of the final flag write is decided under the lock,
        // but the write itself happens outside it.
        let owns_outcome = {
            let mut slots = self.lock_slots();
            match slots.get_mut(ticket) {
                Some(slot) if slot.generation == generation => {
                    slot.cancel = None;
                    true
                }
                _ => false,
            }
        };
        if !owns_outcome {
            debug!(ticket, "Push superseded; outcome discarded");
            return;
        }

        let flag = match outcome {
            PushOutcome::Synced => false,
            PushOutcome::Failed => {
                info!(ticket, "Will retry the sync after the node is next seen");
                true
            }
            PushOutcome::Canceled | PushOutcome::Skipped => return,
        };
        if let Err(e) = self.inner.db.set_sync_next_seen(ticket, flag).await {
            warn!(ticket, error = %e, "Cannot record sync outcome");
        }
    }

    async fn push_inner(&self, ticket: &str, cancel: &CancellationToken) -> PushOutcome {
        let server = match self.inner.db.get_server(ticket).await {
            Ok(server) => server,
            Err(e) => {
                debug!(ticket, error = %e, "Sync skipped");
                return PushOutcome::Skipped;
            }
        };
        let manager = match self.inner.registry.create(&server) {
            Ok(manager) => manager,
            Err(e) => {
                warn!(node = %server.name, error = %e, "Sync skipped");
                return PushOutcome::Skipped;
            }
        };
        let passages =
            match resolver::passages_for_node(&self.inner.db, ticket, unix_timestamp()).await {
                Ok(passages) => passages,
                Err(e) => {
                    debug!(node = %server.name, error = %e, "No passages to push");
                    return PushOutcome::Skipped;
                }
            };

        debug!(node = %server.name, passages = passages.len(), "Pushing passages");
        let call = tokio::time::timeout(
            self.inner.config.push_timeout(),
            manager.sync_passages(passages),
        );
        tokio::select! {
            () = cancel.cancelled() => PushOutcome::Canceled,
            result = call => match result {
                Ok(Ok(())) => PushOutcome::Synced,
                Ok(Err(e)) => {
                    info!(node = %server.name, error = %e, "Passage push failed");
                    PushOutcome::Failed
                }
                Err(_) => {
                    info!(node = %server.name, "Passage push timed out");
                    PushOutcome::Failed
                }
            },
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, NodeSlot>> {
        match self.inner.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Request a push for a node and for its counterpart-type siblings, so
/// both sides of every relay relationship converge.
///
/// Siblings flagged `sync_next_seen` are left alone: they get their one
/// retry when they are next observed alive.
pub async fn request_node_sync(
    db: &Database,
    sync: &SyncScheduler,
    node_ticket: &str,
) -> Result<(), DatabaseError> {
    let ticket = db.get_ticket(node_ticket).await?;
    sync.req_sync(node_ticket);

    let Some(counterpart) = ticket.ticket_type.counterpart() else {
        return Ok(());
    };
    for node in db
        .servers_by_chat(&ticket.chat_identifier, unix_timestamp())
        .await?
    {
        if node.ticket_type == counterpart
            && node.server.ticket != node_ticket
            && !node.server.sync_next_seen
        {
            sync.req_sync(&node.server.ticket);
        }
    }
    Ok(())
}

/// Request a push for every non-flagged node of a chat.
pub async fn request_chat_sync(
    db: &Database,
    sync: &SyncScheduler,
    chat_identifier: &str,
) -> Result<(), DatabaseError> {
    for node in db.servers_by_chat(chat_identifier, unix_timestamp()).await? {
        if !node.server.sync_next_seen {
            sync.req_sync(&node.server.ticket);
        }
    }
    Ok(())
}
