#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the sync scheduler: coalescing, cancellation,
//! and the retry-on-next-seen flag, driven through a scripted mock fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use hawser_daemon::config::SyncConfig;
use hawser_daemon::manager::ManagerError;
use hawser_daemon::manager::ManagerRegistry;
use hawser_daemon::manager::mock::{MockEvent, MockFleet};
use hawser_daemon::passage::{Argument, Protocol};
use hawser_daemon::storage::{
    BandwidthLimit, Database, NEVER_EXPIRES, Server, Ticket, TicketType,
};
use hawser_daemon::sync::SyncScheduler;

struct Harness {
    db: Database,
    fleet: Arc<MockFleet>,
    events: mpsc::UnboundedReceiver<MockEvent>,
    sync: SyncScheduler,
    _shutdown: watch::Sender<bool>,
}

async fn harness(config: SyncConfig) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let (fleet, events) = MockFleet::new();
    let mut registry = ManagerRegistry::new();
    registry.register(Protocol::Shadowsocks, fleet.creator());
    let registry = Arc::new(registry);

    let sync = SyncScheduler::new(db.clone(), registry, config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let sync = sync.clone();
        tokio::spawn(async move { sync.run(shutdown_rx).await });
    }
    {
        let sync = sync.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { sync.run_cleaner(shutdown_rx).await });
    }

    // One registered endpoint, dialed as "h1".
    db.put_ticket(&Ticket {
        ticket: "tic-1".to_string(),
        chat_identifier: "chat-a".to_string(),
        ticket_type: TicketType::Server,
        expire_at: NEVER_EXPIRES,
    })
    .await
    .unwrap();
    db.put_server(&Server {
        ticket: "tic-1".to_string(),
        name: "node-1".to_string(),
        hosts: "h1".to_string(),
        port: 8388,
        argument: Argument::management(Protocol::Shadowsocks, "", "pw"),
        no_relay: false,
        failure_count: 0,
        last_seen: 0,
        sync_next_seen: false,
        bandwidth: BandwidthLimit::default(),
    })
    .await
    .unwrap();

    Harness {
        db,
        fleet,
        events,
        sync,
        _shutdown: shutdown_tx,
    }
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        quiesce_secs: 0,
        push_timeout_secs: 2,
        slot_expiry_secs: 6 * 60 * 60,
        clean_interval_secs: 60 * 60,
    }
}

async fn recv(events: &mut mpsc::UnboundedReceiver<MockEvent>) -> MockEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a fleet event")
        .expect("event stream closed")
}

async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<MockEvent>) {
    let extra = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err(), "unexpected extra event: {:?}", extra.unwrap());
}

async fn flag_becomes(db: &Database, ticket: &str, expected: bool) {
    for _ in 0..200 {
        if db.get_server(ticket).await.unwrap().sync_next_seen == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sync_next_seen never became {expected}");
}

// =========================================================================
// Coalescing
// =========================================================================

#[tokio::test]
async fn burst_of_requests_coalesces_into_one_follow_up_push() {
    let mut h = harness(fast_config()).await;
    let gate = h.fleet.gate_sync("h1");

    h.sync.req_sync("tic-1");
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncStarted { .. }
    ));

    // Five requests land while the push is in flight; the first cancels
    // it and all of them fold into a single pending flag.
    for _ in 0..5 {
        h.sync.req_sync("tic-1");
    }

    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncStarted { .. }
    ));
    gate.add_permits(1);
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncFinished { ok: true, .. }
    ));

    // Exactly one follow-up push, not five.
    assert_quiet(&mut h.events).await;
    flag_becomes(&h.db, "tic-1", false).await;
}

#[tokio::test]
async fn requests_for_an_unknown_node_are_skipped() {
    let mut h = harness(fast_config()).await;
    h.sync.req_sync("ghost");
    assert_quiet(&mut h.events).await;
}

// =========================================================================
// Dirty flag
// =========================================================================

#[tokio::test]
async fn failed_push_sets_the_flag_and_success_clears_it() {
    let mut h = harness(fast_config()).await;
    h.fleet.script_sync(
        "h1",
        Err(ManagerError::Unreachable("connection refused".into())),
    );

    h.sync.req_sync("tic-1");
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncStarted { .. }
    ));
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncFinished { ok: false, .. }
    ));
    flag_becomes(&h.db, "tic-1", true).await;

    // Next push (the node was "seen again") succeeds and clears it.
    h.sync.req_sync("tic-1");
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncStarted { .. }
    ));
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncFinished { ok: true, .. }
    ));
    flag_becomes(&h.db, "tic-1", false).await;
}

// =========================================================================
// Cancellation
// =========================================================================

#[tokio::test]
async fn cancelled_push_neither_sets_nor_clears_the_flag() {
    let mut h = harness(fast_config()).await;
    let gate = h.fleet.gate_sync("h1");

    h.sync.req_sync("tic-1");
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncStarted { .. }
    ));

    // Supersede the in-flight push. Its cancellation must not be recorded
    // as a failure.
    h.sync.req_sync("tic-1");
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncStarted { .. }
    ));
    assert!(!h.db.get_server("tic-1").await.unwrap().sync_next_seen);

    gate.add_permits(1);
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncFinished { ok: true, .. }
    ));
    assert_quiet(&mut h.events).await;
    flag_becomes(&h.db, "tic-1", false).await;
}

// =========================================================================
// Slot garbage collection
// =========================================================================

#[tokio::test]
async fn idle_slots_are_dropped_by_the_cleaner() {
    let mut config = fast_config();
    config.slot_expiry_secs = 0;
    config.clean_interval_secs = 1;
    let mut h = harness(config).await;

    h.sync.req_sync("tic-1");
    assert!(matches!(
        recv(&mut h.events).await,
        MockEvent::SyncFinished { ok: true, .. } | MockEvent::SyncStarted { .. }
    ));
    flag_becomes(&h.db, "tic-1", false).await;

    for _ in 0..50 {
        if h.sync.slot_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("slot was never garbage-collected");
}
