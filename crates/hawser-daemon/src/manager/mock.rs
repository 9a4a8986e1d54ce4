//! Scripted managers for scheduler and maintenance tests.
//!
//! A [`MockFleet`] plays the role of every node agent behind a registry:
//! calls succeed with default responses unless a test queues failures, and
//! `sync_passages` can be gated so a push stays in flight until released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, mpsc};

use super::{ManageArgument, Manager, ManagerCreator, ManagerError, PingReport};
use crate::passage::Passage;

/// Observable side effect of a mock management call, tagged by dial host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Ping(String),
    SyncStarted { host: String, passages: usize },
    SyncFinished { host: String, ok: bool },
}

#[derive(Default)]
struct NodeScript {
    ping: VecDeque<Result<PingReport, ManagerError>>,
    sync: VecDeque<Result<(), ManagerError>>,
    gate: Option<Arc<Semaphore>>,
}

/// A fleet of scripted nodes keyed by dial host.
pub struct MockFleet {
    scripts: Mutex<HashMap<String, NodeScript>>,
    events: mpsc::UnboundedSender<MockEvent>,
}

impl MockFleet {
    /// Create a fleet and the stream of events its nodes will emit.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let fleet = Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            events,
        });
        (fleet, receiver)
    }

    /// Constructor handing out managers backed by this fleet.
    pub fn creator(self: &Arc<Self>) -> ManagerCreator {
        let fleet = Arc::clone(self);
        Box::new(move |arg: ManageArgument| {
            Box::new(MockManager {
                host: arg.host,
                fleet: Arc::clone(&fleet),
            }) as Box<dyn Manager>
        })
    }

    /// Queue the next ping result for `host`.
    pub fn script_ping(&self, host: &str, result: Result<PingReport, ManagerError>) {
        self.with_script(host, |script| script.ping.push_back(result));
    }

    /// Queue the next sync result for `host`.
    pub fn script_sync(&self, host: &str, result: Result<(), ManagerError>) {
        self.with_script(host, |script| script.sync.push_back(result));
    }

    /// Gate `sync_passages` for `host`: each call consumes one permit from
    /// the returned semaphore before completing.
    pub fn gate_sync(&self, host: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        let handle = Arc::clone(&gate);
        self.with_script(host, move |script| script.gate = Some(handle));
        gate
    }

    fn with_script<F: FnOnce(&mut NodeScript)>(&self, host: &str, f: F) {
        let mut scripts = self.lock();
        f(scripts.entry(host.to_string()).or_default());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, NodeScript>> {
        match self.scripts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct MockManager {
    host: String,
    fleet: Arc<MockFleet>,
}

#[async_trait::async_trait]
impl Manager for MockManager {
    async fn ping(&self) -> Result<PingReport, ManagerError> {
        let _ = self.fleet.events.send(MockEvent::Ping(self.host.clone()));
        let mut scripts = self.fleet.lock();
        scripts
            .entry(self.host.clone())
            .or_default()
            .ping
            .pop_front()
            .unwrap_or_else(|| Ok(PingReport::default()))
    }

    async fn sync_passages(&self, passages: Vec<Passage>) -> Result<(), ManagerError> {
        let gate = {
            let mut scripts = self.fleet.lock();
            scripts.entry(self.host.clone()).or_default().gate.clone()
        };
        let _ = self.fleet.events.send(MockEvent::SyncStarted {
            host: self.host.clone(),
            passages: passages.len(),
        });
        if let Some(gate) = gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(ManagerError::Unreachable("gate closed".to_string())),
            }
        }
        let result = {
            let mut scripts = self.fleet.lock();
            scripts
                .entry(self.host.clone())
                .or_default()
                .sync
                .pop_front()
                .unwrap_or(Ok(()))
        };
        let _ = self.fleet.events.send(MockEvent::SyncFinished {
            host: self.host.clone(),
            ok: result.is_ok(),
        });
        result
    }
}
