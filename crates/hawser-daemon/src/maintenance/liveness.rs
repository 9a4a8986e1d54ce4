//! Liveness pings: the concurrent-compute instance that tracks fleet
//! health and bandwidth accounting.
//!
//! Each tick pings every node below the failure cap with a bounded
//! timeout. Transitions that change externally visible status (disconnect,
//! bandwidth exhausted, cycle rollover, pending retry flag) schedule a
//! deferred sync request so downstream relays and servers learn about it.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Keyed, ServerBucket, spawn_tick_update};
use crate::config::MaintenanceConfig;
use crate::manager::{ManagerRegistry, PingReport};
use crate::storage::{Database, MAX_FAILURE_COUNT, Server};
use crate::sync::{self, SyncScheduler};

struct LivenessCtx {
    db: Database,
    registry: Arc<ManagerRegistry>,
    sync: SyncScheduler,
    config: MaintenanceConfig,
}

/// Spawn the periodic liveness job over the server bucket.
pub fn spawn_liveness(
    db: Database,
    registry: Arc<ManagerRegistry>,
    sync: SyncScheduler,
    config: MaintenanceConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let bucket = ServerBucket::new(db.clone());
    let interval = config.ping_interval();
    let ctx = Arc::new(LivenessCtx {
        db,
        registry,
        sync,
        config,
    });
    spawn_tick_update(
        bucket,
        interval,
        move |record, now| {
            let ctx = Arc::clone(&ctx);
            async move { ping_node(&ctx, record, now).await }
        },
        shutdown,
    )
}

async fn ping_node(
    ctx: &Arc<LivenessCtx>,
    keyed: Keyed<Server>,
    now: i64,
) -> Option<Keyed<Server>> {
    let server = keyed.record;

    // A down node is not pinged again; it has to re-register.
    if server.is_down() {
        return None;
    }

    let manager = match ctx.registry.create(&server) {
        Ok(manager) => manager,
        Err(e) => {
            warn!(node = %server.name, error = %e, "Cannot ping node");
            return None;
        }
    };

    let record = match tokio::time::timeout(ctx.config.ping_timeout(), manager.ping()).await {
        Ok(Ok(report)) => on_ping_success(ctx, server, &report, now),
        Ok(Err(e)) => {
            info!(node = %server.name, error = %e, "Ping failed");
            on_ping_failure(ctx, server)
        }
        Err(_) => {
            info!(node = %server.name, "Ping timed out");
            on_ping_failure(ctx, server)
        }
    };
    Some(Keyed {
        key: keyed.key,
        record,
    })
}

fn on_ping_failure(ctx: &Arc<LivenessCtx>, mut server: Server) -> Server {
    server.failure_count += 1;
    if server.failure_count >= MAX_FAILURE_COUNT {
        info!(node = %server.name, "Node disconnected");
        schedule_resync(ctx, server.ticket.clone());
    }
    server
}

fn on_ping_success(
    ctx: &Arc<LivenessCtx>,
    mut server: Server,
    report: &PingReport,
    now: i64,
) -> Server {
    let mut resync = server.sync_next_seen;
    server.failure_count = 0;
    server.last_seen = now;

    let bandwidth = &mut server.bandwidth;
    if bandwidth.is_time_to_reset(now) {
        if bandwidth.exhausted() {
            info!(node = %server.name, "Bandwidth cycle reset; node usable again");
        }
        bandwidth.update(&report.bandwidth);
        bandwidth.reset(now);
        resync = true;
    } else if bandwidth.exhausted() {
        bandwidth.update(&report.bandwidth);
    } else {
        bandwidth.update(&report.bandwidth);
        if bandwidth.exhausted() {
            info!(node = %server.name, "Bandwidth exhausted");
            resync = true;
        }
    }

    if resync {
        schedule_resync(ctx, server.ticket.clone());
    }
    server
}

/// Defer the fan-out so it runs after the tick's write-back commits.
fn schedule_resync(ctx: &Arc<LivenessCtx>, node_ticket: String) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        tokio::time::sleep(ctx.config.resync_delay()).await;
        if let Err(e) = sync::request_node_sync(&ctx.db, &ctx.sync, &node_ticket).await {
            warn!(ticket = %node_ticket, error = %e, "Deferred sync request failed");
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::SyncConfig;
    use crate::manager::ManagerError;
    use crate::manager::mock::{MockEvent, MockFleet};
    use crate::passage::{Argument, Protocol};
    use crate::storage::BandwidthLimit;

    async fn test_ctx() -> (
        Arc<LivenessCtx>,
        Arc<MockFleet>,
        mpsc::UnboundedReceiver<MockEvent>,
    ) {
        let db = Database::open_in_memory().await.unwrap();
        let (fleet, events) = MockFleet::new();
        let mut registry = ManagerRegistry::new();
        registry.register(Protocol::Shadowsocks, fleet.creator());
        let registry = Arc::new(registry);
        let sync = SyncScheduler::new(db.clone(), Arc::clone(&registry), SyncConfig::default());
        let config = MaintenanceConfig {
            resync_delay_secs: 0,
            ping_timeout_secs: 1,
            ..MaintenanceConfig::default()
        };
        let ctx = Arc::new(LivenessCtx {
            db,
            registry,
            sync,
            config,
        });
        (ctx, fleet, events)
    }

    fn node(host: &str) -> Keyed<Server> {
        Keyed {
            key: "tic-1".to_string(),
            record: Server {
                ticket: "tic-1".to_string(),
                name: "node-1".to_string(),
                hosts: host.to_string(),
                port: 8388,
                argument: Argument::management(Protocol::Shadowsocks, "", "pw"),
                no_relay: false,
                failure_count: 0,
                last_seen: 0,
                sync_next_seen: false,
                bandwidth: BandwidthLimit::default(),
            },
        }
    }

    #[tokio::test]
    async fn down_node_is_left_alone() {
        let (ctx, _fleet, mut events) = test_ctx().await;
        let mut keyed = node("10.0.0.1");
        keyed.record.failure_count = MAX_FAILURE_COUNT;

        assert!(ping_node(&ctx, keyed, 100).await.is_none());
        assert!(events.try_recv().is_err(), "no ping must have been sent");
    }

    #[tokio::test]
    async fn failed_ping_increments_the_counter() {
        let (ctx, fleet, _events) = test_ctx().await;
        fleet.script_ping(
            "10.0.0.1",
            Err(ManagerError::Unreachable("connection refused".into())),
        );

        let updated = ping_node(&ctx, node("10.0.0.1"), 100).await.unwrap();
        assert_eq!(updated.record.failure_count, 1);
        assert_eq!(updated.record.last_seen, 0, "failure must not touch last_seen");
    }

    #[tokio::test]
    async fn successful_ping_resets_counter_and_stamps_last_seen() {
        let (ctx, _fleet, mut events) = test_ctx().await;
        let mut keyed = node("10.0.0.1");
        keyed.record.failure_count = 4;

        let updated = ping_node(&ctx, keyed, 1_234).await.unwrap();
        assert_eq!(updated.record.failure_count, 0);
        assert_eq!(updated.record.last_seen, 1_234);
        assert_eq!(
            events.try_recv().unwrap(),
            MockEvent::Ping("10.0.0.1".to_string())
        );
    }

    #[tokio::test]
    async fn reported_counters_can_exhaust_the_node() {
        let (ctx, fleet, _events) = test_ctx().await;
        let mut keyed = node("10.0.0.1");
        keyed.record.bandwidth.total_limit_kib = 100;

        fleet.script_ping(
            "10.0.0.1",
            Ok(PingReport {
                bandwidth: BandwidthLimit {
                    total_limit_kib: 100,
                    uplink_kib: 150,
                    ..BandwidthLimit::default()
                },
            }),
        );

        let updated = ping_node(&ctx, keyed, 100).await.unwrap();
        assert!(updated.record.bandwidth.exhausted());
    }

    #[tokio::test]
    async fn node_without_a_registered_manager_is_skipped() {
        let (ctx, _fleet, _events) = test_ctx().await;
        let mut keyed = node("10.0.0.1");
        keyed.record.argument = Argument::management(Protocol::Juicity, "", "pw");
        assert!(ping_node(&ctx, keyed, 100).await.is_none());
    }
}
