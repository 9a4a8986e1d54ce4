//! Generic periodic maintenance framework.
//!
//! Two job shapes drive all background bookkeeping:
//!
//! * [`spawn_expire_sweep`] -- each tick deletes every record matching a
//!   pure predicate inside ONE read-write transaction, so deletions are
//!   atomic with respect to concurrent readers, then hands the deleted
//!   records to a post-commit callback.
//! * [`spawn_tick_update`] -- "optimistic batch apply": each tick copies
//!   every record out of one read pass, runs `compute` concurrently per
//!   record (slow, side-effecting work such as bounded-timeout pings
//!   happens here, outside any lock), joins all workers, and applies the
//!   produced mutations in one write transaction.
//!
//! Per-record errors are logged and the batch continues; a maintenance
//! tick never takes the process down.

mod buckets;
pub mod liveness;
pub mod sweeps;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hawser_core::db::unix_timestamp;

use crate::storage::DatabaseError;

pub use buckets::{ServerBucket, TicketBucket};

/// One record copied out of a bucket, together with its key.
#[derive(Debug, Clone)]
pub struct Keyed<R> {
    pub key: String,
    pub record: R,
}

/// Storage access for one bucket, as seen by the job drivers.
#[async_trait]
pub trait Bucket: Clone + Send + Sync + 'static {
    type Record: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Copy every record out of one consistent read pass.
    async fn load_all(&self) -> Result<Vec<Keyed<Self::Record>>, DatabaseError>;

    /// Delete every record matching `is_expired` in one read-write
    /// transaction; returns the deleted records after commit.
    async fn sweep_expired(
        &self,
        is_expired: &(dyn for<'a> Fn(&'a Self::Record, i64) -> bool + Send + Sync),
        now: i64,
    ) -> Result<Vec<Keyed<Self::Record>>, DatabaseError>;

    /// Apply a batch of mutations in one write transaction.
    async fn apply(&self, mutations: Vec<Keyed<Self::Record>>) -> Result<(), DatabaseError>;
}

/// Spawn a periodic expiry sweep over `bucket`.
///
/// `is_expired` must be pure; cross-bucket side effects (follow-up
/// deletions, sync requests) belong in `on_deleted`, which runs after the
/// sweep transaction commits and only when something was deleted.
pub fn spawn_expire_sweep<B, F, N, NFut>(
    bucket: B,
    interval: Duration,
    is_expired: F,
    on_deleted: N,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    B: Bucket,
    F: Fn(&B::Record, i64) -> bool + Send + Sync + 'static,
    N: Fn(Vec<Keyed<B::Record>>) -> NFut + Send + Sync + 'static,
    NFut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let now = unix_timestamp();
                    match bucket.sweep_expired(&is_expired, now).await {
                        Ok(deleted) if !deleted.is_empty() => {
                            debug!(bucket = bucket.name(), count = deleted.len(), "Sweep removed records");
                            on_deleted(deleted).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(bucket = bucket.name(), error = %e, "Expiry sweep failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Spawn a periodic concurrent-compute-then-batch-write job over `bucket`.
///
/// Each tick detaches, so a slow batch never delays the next tick; each
/// record's `compute` runs as its own task and may block on network I/O.
/// `compute` returning `None` leaves the record untouched.
pub fn spawn_tick_update<B, C, Fut>(
    bucket: B,
    interval: Duration,
    compute: C,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    B: Bucket,
    C: Fn(Keyed<B::Record>, i64) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Option<Keyed<B::Record>>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let bucket = bucket.clone();
                    let compute = compute.clone();
                    tokio::spawn(async move { run_tick(&bucket, &compute).await });
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

async fn run_tick<B, C, Fut>(bucket: &B, compute: &C)
where
    B: Bucket,
    C: Fn(Keyed<B::Record>, i64) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Option<Keyed<B::Record>>> + Send + 'static,
{
    let now = unix_timestamp();
    let records = match bucket.load_all().await {
        Ok(records) => records,
        Err(e) => {
            warn!(bucket = bucket.name(), error = %e, "Cannot load bucket");
            return;
        }
    };

    let workers: Vec<_> = records
        .into_iter()
        .map(|record| tokio::spawn(compute(record, now)))
        .collect();

    let mut mutations = Vec::new();
    for worker in workers {
        match worker.await {
            Ok(Some(mutation)) => mutations.push(mutation),
            Ok(None) => {}
            Err(e) => warn!(bucket = bucket.name(), error = %e, "Maintenance worker failed"),
        }
    }

    if mutations.is_empty() {
        return;
    }
    if let Err(e) = bucket.apply(mutations).await {
        warn!(bucket = bucket.name(), error = %e, "Cannot apply maintenance batch");
    }
}
