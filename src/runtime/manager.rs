//! Async face of the apply engine.
//!
//! The engine itself is synchronous and single-owner; the manager runs it on
//! a dedicated tokio task fed by a mailbox. `apply` resolves a oneshot with
//! the target entry's outcome, `apply_all` is fire-and-forget, and the
//! compactor runs on the same task so snapshot work never overlaps apply or
//! itself. Session event batches produced by apply are fanned out to
//! per-session subscribers.

use crate::apply::compactor::Compactor;
use crate::apply::engine::{ApplyEngine, ApplyOutcome};
use crate::core::config::{ReadConsistency, ServerConfig};
use crate::core::error::{RaftError, RaftResult};
use crate::log::entry::{Operation, OperationResult};
use crate::log::store::SharedLog;
use crate::protocol::PublishMessage;
use crate::service::ServiceRegistry;
use crate::storage::snapshot::SnapshotStore;
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// What the query gate needs to know about a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSummary {
    pub command_sequence: u64,
    pub read_consistency: ReadConsistency,
    pub open: bool,
}

enum ManagerMsg {
    ApplyAll(u64),
    Apply {
        index: u64,
        reply: oneshot::Sender<RaftResult<ApplyOutcome>>,
    },
    Query {
        session_id: u64,
        operation: Operation,
        reply: oneshot::Sender<RaftResult<OperationResult>>,
    },
    SessionInfo {
        session_id: u64,
        reply: oneshot::Sender<Option<SessionSummary>>,
    },
    Subscribe {
        session_id: u64,
        sender: mpsc::UnboundedSender<PublishMessage>,
    },
    CompactNow {
        reply: oneshot::Sender<Option<u64>>,
    },
    LastApplied {
        reply: oneshot::Sender<u64>,
    },
}

/// Handle to the apply task.
#[derive(Clone)]
pub struct ServiceManager {
    tx: mpsc::UnboundedSender<ManagerMsg>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceManager {
    /// Start the apply task over the shared log.
    ///
    /// Any snapshots already present in the store are installed first, so a
    /// restarted server resumes from snapshot plus log tail.
    pub fn start(log: SharedLog, registry: ServiceRegistry, config: &ServerConfig) -> Result<Self> {
        let store = SnapshotStore::open(&config.snapshot_dir)?;
        let mut engine = ApplyEngine::new(log.clone(), registry);
        for snapshot in store.load_all_latest()? {
            engine
                .install_snapshot(&snapshot)
                .map_err(|e| anyhow::anyhow!("failed to install snapshot: {e}"))?;
        }
        let compactor = Compactor::new(log, store);
        Ok(Self::spawn(engine, compactor, config.compact_interval_ms))
    }

    fn spawn(engine: ApplyEngine, compactor: Compactor, compact_interval_ms: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ManagerTask {
            engine,
            compactor,
            subscribers: HashMap::new(),
        };
        tokio::spawn(task.run(rx, shutdown_rx, compact_interval_ms));
        Self { tx, shutdown_tx }
    }

    /// Apply commits up to `index`, expecting no result.
    pub fn apply_all(&self, index: u64) {
        let _ = self.tx.send(ManagerMsg::ApplyAll(index));
    }

    /// Apply up to and including `index`, resolving with that entry's
    /// outcome.
    pub async fn apply(&self, index: u64) -> RaftResult<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Apply { index, reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Run a query against current state on the apply task.
    pub async fn query(&self, session_id: u64, operation: Operation) -> RaftResult<OperationResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Query {
                session_id,
                operation,
                reply,
            })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Inspect one session.
    pub async fn session_info(&self, session_id: u64) -> RaftResult<Option<SessionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::SessionInfo { session_id, reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Subscribe to event pushes for a session. The newest subscription
    /// wins; earlier ones stop receiving.
    pub fn subscribe(&self, session_id: u64) -> mpsc::UnboundedReceiver<PublishMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribe_with(session_id, sender);
        receiver
    }

    /// Subscribe with a caller-supplied sender.
    pub fn subscribe_with(&self, session_id: u64, sender: mpsc::UnboundedSender<PublishMessage>) {
        let _ = self.tx.send(ManagerMsg::Subscribe { session_id, sender });
    }

    /// Force a compaction round now. Returns the truncation index if one
    /// ran.
    pub async fn compact_now(&self) -> RaftResult<Option<u64>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::CompactNow { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// The engine's last applied index.
    pub async fn last_applied(&self) -> RaftResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::LastApplied { reply })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Stop the apply task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct ManagerTask {
    engine: ApplyEngine,
    compactor: Compactor,
    subscribers: HashMap<u64, mpsc::UnboundedSender<PublishMessage>>,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ManagerMsg>,
        mut shutdown_rx: watch::Receiver<bool>,
        compact_interval_ms: u64,
    ) {
        let mut compact_tick =
            tokio::time::interval(Duration::from_millis(compact_interval_ms));
        compact_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        compact_tick.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = compact_tick.tick() => {
                    self.compact();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("service manager stopped");
    }

    fn handle(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::ApplyAll(index) => {
                if let Err(err) = self.engine.apply_all(index) {
                    tracing::error!(index, error = %err, "apply-all failed");
                }
                self.forward_publishes();
            }
            ManagerMsg::Apply { index, reply } => {
                let outcome = self.engine.apply(index);
                self.forward_publishes();
                let _ = reply.send(outcome);
            }
            ManagerMsg::Query {
                session_id,
                operation,
                reply,
            } => {
                let _ = reply.send(self.engine.query(session_id, &operation));
            }
            ManagerMsg::SessionInfo { session_id, reply } => {
                let summary = self.engine.session(session_id).map(|s| SessionSummary {
                    command_sequence: s.command_sequence(),
                    read_consistency: s.read_consistency(),
                    open: s.is_open(),
                });
                let _ = reply.send(summary);
            }
            ManagerMsg::Subscribe { session_id, sender } => {
                self.subscribers.insert(session_id, sender);
            }
            ManagerMsg::CompactNow { reply } => {
                let _ = reply.send(self.compact());
            }
            ManagerMsg::LastApplied { reply } => {
                let _ = reply.send(self.engine.last_applied());
            }
        }
    }

    fn compact(&mut self) -> Option<u64> {
        match self.compactor.maybe_compact(&mut self.engine) {
            Ok(index) => index,
            Err(err) => {
                tracing::warn!(error = %err, "compaction round failed");
                None
            }
        }
    }

    /// Push freshly queued event batches to live subscribers.
    fn forward_publishes(&mut self) {
        for (session_id, batch) in self.engine.take_publishes() {
            if let Some(sender) = self.subscribers.get(&session_id) {
                let message = PublishMessage {
                    session_id,
                    event_index: batch.index,
                    events: batch.events,
                };
                if sender.send(message).is_err() {
                    self.subscribers.remove(&session_id);
                }
            }
        }
    }
}
