//! Per-service execution environment.
//!
//! One context exists per named service, created by the first OpenSession
//! entry that names it. The context enforces the session contract around the
//! user service: exactly-once command effects per `(session, sequence)`,
//! event fan-out tagged with the producing index, keep-alive bookkeeping and
//! expiry, and snapshot assembly. All calls arrive serialized from the apply
//! engine, so the service itself runs single-threaded.

use crate::core::error::{RaftError, RaftResult};
use crate::core::time::LogTime;
use crate::log::entry::{Operation, OperationResult};
use crate::service::{CommandContext, EventSink, Service, ServiceResult};
use crate::session::{EventBatch, SessionState, SessionTable};
use crate::storage::snapshot::ServiceSnapshot;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Events to push to live session channels, in `(session, index)` order.
pub type Publishes = Vec<(u64, EventBatch)>;

/// Execution environment for one named service.
pub struct ServiceContext {
    service_id: u64,
    name: String,
    service_type: String,
    service: Box<dyn Service>,
    current_time: LogTime,
    last_applied: u64,
    last_snapshot_index: u64,
    pending_snapshot_index: Option<u64>,
}

impl ServiceContext {
    /// Create a context for a service instantiated at `service_id` (the
    /// index of the OpenSession entry that created it).
    pub fn new(
        service_id: u64,
        name: impl Into<String>,
        service_type: impl Into<String>,
        service: Box<dyn Service>,
    ) -> Self {
        Self {
            service_id,
            name: name.into(),
            service_type: service_type.into(),
            service,
            current_time: LogTime::zero(),
            last_applied: service_id,
            last_snapshot_index: 0,
            pending_snapshot_index: None,
        }
    }

    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Timestamp of the newest entry this service has observed.
    pub fn current_time(&self) -> LogTime {
        self.current_time
    }

    /// Index of the newest entry this service has observed.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Index of the last completed snapshot.
    pub fn last_snapshot_index(&self) -> u64 {
        self.last_snapshot_index
    }

    fn advance(&mut self, index: u64, timestamp: LogTime) {
        self.last_applied = self.last_applied.max(index);
        self.current_time = self.current_time.max(timestamp);
    }

    // ------------------------------------------------------------------
    // Time pulses and keep-alive
    // ------------------------------------------------------------------

    /// Advance observed time without deciding expiry.
    ///
    /// Driven by Initialize and Configuration entries so sessions keep a
    /// monotonic time source through leadership churn.
    pub fn keep_alive_sessions(&mut self, index: u64, timestamp: LogTime) {
        self.advance(index, timestamp);
    }

    /// Apply one slot of a keep-alive entry to one session.
    ///
    /// Refreshes the heartbeat and releases acknowledged command results and
    /// event batches. Returns whether the session was still live.
    pub fn keep_alive(
        &mut self,
        index: u64,
        timestamp: LogTime,
        sessions: &mut SessionTable,
        session_id: u64,
        command_sequence: u64,
        event_index: u64,
    ) -> bool {
        self.advance(index, timestamp);
        match sessions.get_open_mut(session_id) {
            Some(session) if session.service_name() == self.name => {
                session.heartbeat(timestamp);
                session.ack_commands(command_sequence);
                session.ack_events(event_index);
                true
            }
            _ => false,
        }
    }

    /// Finish a keep-alive entry: expire every open session of this service
    /// whose heartbeat is older than its timeout.
    ///
    /// Expired sessions stay in the table until compaction; only their
    /// status changes. The expire hook runs exactly once per session and may
    /// publish events to the survivors.
    pub fn complete_keep_alive(
        &mut self,
        index: u64,
        timestamp: LogTime,
        sessions: &mut SessionTable,
    ) -> Publishes {
        self.advance(index, timestamp);
        let now = self.current_time;

        let expired: Vec<u64> = sessions
            .for_service(&self.name)
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id())
            .collect();

        let mut broadcast = Vec::new();
        for session_id in &expired {
            if let Some(session) = sessions.get_mut(*session_id) {
                session.expire();
            }
            tracing::debug!(
                service = %self.name,
                session = session_id,
                "session expired"
            );
            let mut sink = EventSink::default();
            self.service.expire_session(*session_id, &mut sink);
            // The expiring session can no longer receive events; only
            // broadcasts to survivors are kept.
            let (_, to_all) = sink.into_parts();
            broadcast.extend(to_all);
        }

        let mut sink = EventSink::default();
        for payload in broadcast {
            sink.broadcast(payload);
        }
        self.fan_out(index, None, sink, sessions)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Run the open-session hook for a freshly registered session.
    pub fn open_session(
        &mut self,
        index: u64,
        timestamp: LogTime,
        session_id: u64,
        sessions: &mut SessionTable,
    ) -> Publishes {
        self.advance(index, timestamp);
        let mut sink = EventSink::default();
        self.service.open_session(session_id, &mut sink);
        self.fan_out(index, Some(session_id), sink, sessions)
    }

    /// Close a session explicitly and run the close hook.
    pub fn close_session(
        &mut self,
        index: u64,
        timestamp: LogTime,
        session_id: u64,
        sessions: &mut SessionTable,
    ) -> Publishes {
        self.advance(index, timestamp);
        if let Some(session) = sessions.get_mut(session_id) {
            session.close();
        }
        let mut sink = EventSink::default();
        self.service.close_session(session_id, &mut sink);
        // The closed session itself no longer receives events.
        self.fan_out(index, None, sink, sessions)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Execute a command entry against the service.
    ///
    /// Sequences at or below the session's committed sequence replay the
    /// cached result without re-executing; the next expected sequence
    /// executes and is cached. Anything else is a protocol anomaly reported
    /// without halting apply.
    pub fn execute_command(
        &mut self,
        index: u64,
        timestamp: LogTime,
        sessions: &mut SessionTable,
        session_id: u64,
        sequence: u64,
        operation: &Operation,
    ) -> RaftResult<(OperationResult, Publishes)> {
        self.advance(index, timestamp);

        let session = sessions
            .get_open(session_id)
            .ok_or(RaftError::UnknownSession(session_id))?;

        if sequence <= session.command_sequence() {
            return match session.cached_result(sequence) {
                Some(result) => Ok((result.clone(), Vec::new())),
                // Acknowledged results are released; a retransmit after the
                // ack is a protocol anomaly.
                None => Err(RaftError::Protocol(format!(
                    "result for sequence {sequence} of session {session_id} already released"
                ))),
            };
        }
        if sequence != session.command_sequence() + 1 {
            return Err(RaftError::Protocol(format!(
                "command sequence gap for session {session_id}: expected {}, got {sequence}",
                session.command_sequence() + 1
            )));
        }

        let ctx = CommandContext {
            index,
            timestamp,
            session_id,
        };
        let mut sink = EventSink::default();
        let output = self
            .service
            .apply_command(&ctx, operation, &mut sink)
            .map_err(|e| e.0);

        let publishes = self.fan_out(index, Some(session_id), sink, sessions);

        // The result's event horizon is the newest event published to the
        // producing session, this command's included.
        let session = sessions
            .get_open_mut(session_id)
            .ok_or(RaftError::UnknownSession(session_id))?;
        let result = OperationResult {
            index,
            event_index: session.last_event_index(),
            output,
        };
        session.complete_command(sequence, result.clone());
        Ok((result, publishes))
    }

    /// Execute a query against current state. No mutation, no sequence
    /// advance, no events.
    pub fn execute_query(
        &self,
        sessions: &SessionTable,
        session_id: u64,
        operation: &Operation,
    ) -> RaftResult<OperationResult> {
        let session = sessions
            .get_open(session_id)
            .ok_or(RaftError::UnknownSession(session_id))?;
        let output = self.service.apply_query(operation).map_err(|e| e.0);
        Ok(OperationResult {
            index: self.last_applied,
            event_index: session.last_event_index(),
            output,
        })
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture the service and its sessions at the current applied index.
    pub fn take_snapshot(&mut self, sessions: &SessionTable) -> ServiceResult<ServiceSnapshot> {
        let state = self.service.snapshot()?;
        let snapshot = ServiceSnapshot {
            service_id: self.service_id,
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            index: self.last_applied,
            current_time: self.current_time,
            state,
            sessions: sessions.for_service(&self.name).cloned().collect(),
        };
        self.pending_snapshot_index = Some(snapshot.index);
        Ok(snapshot)
    }

    /// Mark the snapshot at `index` durable, releasing the log beneath it.
    pub fn complete_snapshot(&mut self, index: u64) {
        if self.pending_snapshot_index == Some(index) {
            self.pending_snapshot_index = None;
        }
        self.last_snapshot_index = self.last_snapshot_index.max(index);
    }

    /// Rebuild a context from a snapshot. The caller re-registers the
    /// snapshot's sessions in its table.
    pub fn from_snapshot(
        snapshot: &ServiceSnapshot,
        mut service: Box<dyn Service>,
    ) -> ServiceResult<Self> {
        service.restore(&snapshot.state)?;
        Ok(Self {
            service_id: snapshot.service_id,
            name: snapshot.name.clone(),
            service_type: snapshot.service_type.clone(),
            service,
            current_time: snapshot.current_time,
            last_applied: snapshot.index,
            last_snapshot_index: snapshot.index,
            pending_snapshot_index: None,
        })
    }

    /// Sessions to restore alongside [`ServiceContext::from_snapshot`].
    pub fn snapshot_sessions(snapshot: &ServiceSnapshot) -> impl Iterator<Item = &SessionState> {
        snapshot.sessions.iter()
    }

    // ------------------------------------------------------------------

    /// Queue sink events into session queues and collect live publishes.
    fn fan_out(
        &self,
        index: u64,
        origin: Option<u64>,
        sink: EventSink,
        sessions: &mut SessionTable,
    ) -> Publishes {
        if sink.is_empty() {
            return Vec::new();
        }
        let (to_session, to_all) = sink.into_parts();

        let mut per_target: BTreeMap<u64, Vec<Bytes>> = BTreeMap::new();
        if let Some(origin) = origin {
            if sessions.get_open(origin).is_some() && !to_session.is_empty() {
                per_target.entry(origin).or_default().extend(to_session);
            }
        }
        if !to_all.is_empty() {
            let targets: Vec<u64> = sessions
                .for_service(&self.name)
                .filter(|s| s.is_open())
                .map(|s| s.id())
                .collect();
            for target in targets {
                per_target
                    .entry(target)
                    .or_default()
                    .extend(to_all.iter().cloned());
            }
        }

        let mut publishes = Vec::with_capacity(per_target.len());
        for (session_id, events) in per_target {
            if let Some(session) = sessions.get_open_mut(session_id) {
                session.queue_events(index, events.clone());
                publishes.push((session_id, EventBatch { index, events }));
            }
        }
        publishes
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("service_id", &self.service_id)
            .field("name", &self.name)
            .field("service_type", &self.service_type)
            .field("last_applied", &self.last_applied)
            .field("last_snapshot_index", &self.last_snapshot_index)
            .finish()
    }
}
