//! Server-side session state.
//!
//! A session is created by the OpenSession entry whose index becomes its id.
//! It carries the per-session command sequence, the cached command results
//! that make retries idempotent, and the ordered queue of events awaiting
//! client acknowledgement. Terminal states are absorbing: once a session
//! leaves Open it never returns, and the entry itself survives until
//! compaction so duplicate keep-alives are rejected cleanly.

use crate::core::config::ReadConsistency;
use crate::core::time::LogTime;
use crate::log::entry::OperationResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Lifecycle state of a server-side session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Open,
    Expired,
    Closed,
}

/// Events published at a single log index for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Index of the command entry that produced the events.
    pub index: u64,
    /// Payloads in publish order.
    pub events: Vec<Bytes>,
}

/// A single session as tracked by the apply engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    id: u64,
    client_id: String,
    service_name: String,
    service_type: String,
    read_consistency: ReadConsistency,
    timeout_ms: u64,
    last_heartbeat: LogTime,
    command_sequence: u64,
    event_ack_index: u64,
    last_event_index: u64,
    results: BTreeMap<u64, OperationResult>,
    pending_events: VecDeque<EventBatch>,
    status: SessionStatus,
}

impl SessionState {
    /// Create an open session from an OpenSession entry.
    pub fn new(
        id: u64,
        client_id: impl Into<String>,
        service_name: impl Into<String>,
        service_type: impl Into<String>,
        read_consistency: ReadConsistency,
        timeout_ms: u64,
        opened_at: LogTime,
    ) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            service_name: service_name.into(),
            service_type: service_type.into(),
            read_consistency,
            timeout_ms,
            last_heartbeat: opened_at,
            command_sequence: 0,
            event_ack_index: 0,
            last_event_index: 0,
            results: BTreeMap::new(),
            pending_events: VecDeque::new(),
            status: SessionStatus::Open,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn read_consistency(&self) -> ReadConsistency {
        self.read_consistency
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Highest command sequence applied for this session.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Index of the newest event published to this session.
    pub fn last_event_index(&self) -> u64 {
        self.last_event_index
    }

    /// Highest event index the client has acknowledged.
    pub fn event_ack_index(&self) -> u64 {
        self.event_ack_index
    }

    /// Timestamp of the last heartbeat observed in the log.
    pub fn last_heartbeat(&self) -> LogTime {
        self.last_heartbeat
    }

    // ------------------------------------------------------------------
    // Heartbeats and expiry
    // ------------------------------------------------------------------

    /// Refresh the heartbeat from a committed keep-alive.
    pub fn heartbeat(&mut self, now: LogTime) {
        if self.is_open() {
            self.last_heartbeat = self.last_heartbeat.max(now);
        }
    }

    /// Whether this session has outlived its timeout at `now`.
    pub fn is_expired_at(&self, now: LogTime) -> bool {
        self.is_open() && now.since(self.last_heartbeat) > self.timeout_ms
    }

    /// Transition to Expired. No-op in terminal states.
    pub fn expire(&mut self) {
        if self.is_open() {
            self.status = SessionStatus::Expired;
        }
    }

    /// Transition to Closed. No-op in terminal states.
    pub fn close(&mut self) {
        if self.is_open() {
            self.status = SessionStatus::Closed;
        }
    }

    // ------------------------------------------------------------------
    // Command dedup cache
    // ------------------------------------------------------------------

    /// Look up the cached result for an already-applied sequence.
    pub fn cached_result(&self, sequence: u64) -> Option<&OperationResult> {
        self.results.get(&sequence)
    }

    /// Record the result of a newly applied command and advance the
    /// sequence.
    pub fn complete_command(&mut self, sequence: u64, result: OperationResult) {
        debug_assert_eq!(sequence, self.command_sequence + 1);
        self.command_sequence = sequence;
        self.results.insert(sequence, result);
    }

    /// Release cached results at or below the acknowledged sequence.
    pub fn ack_commands(&mut self, sequence: u64) {
        self.results.retain(|&seq, _| seq > sequence);
    }

    /// Number of retained command results.
    pub fn cached_result_count(&self) -> usize {
        self.results.len()
    }

    // ------------------------------------------------------------------
    // Event queue
    // ------------------------------------------------------------------

    /// Append events produced at `index`.
    ///
    /// Indexes arrive strictly increasing because entries apply in order.
    pub fn queue_events(&mut self, index: u64, events: Vec<Bytes>) {
        if events.is_empty() {
            return;
        }
        debug_assert!(index > self.last_event_index);
        self.last_event_index = index;
        self.pending_events.push_back(EventBatch { index, events });
    }

    /// Drop event batches at or below the acknowledged index.
    pub fn ack_events(&mut self, event_index: u64) {
        self.event_ack_index = self.event_ack_index.max(event_index);
        while let Some(front) = self.pending_events.front() {
            if front.index <= event_index {
                self.pending_events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Pending event batches in index order.
    pub fn pending_events(&self) -> impl Iterator<Item = &EventBatch> {
        self.pending_events.iter()
    }

    /// Number of pending event batches.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionState {
        SessionState::new(
            10,
            "client-1",
            "test",
            "kv",
            ReadConsistency::Linearizable,
            1_000,
            LogTime::new(0),
        )
    }

    #[test]
    fn expiry_follows_log_time() {
        let mut s = session();
        assert!(!s.is_expired_at(LogTime::new(1_000)));
        assert!(s.is_expired_at(LogTime::new(1_001)));

        s.heartbeat(LogTime::new(900));
        assert!(!s.is_expired_at(LogTime::new(1_500)));
        assert!(s.is_expired_at(LogTime::new(1_901)));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut s = session();
        s.expire();
        assert_eq!(s.status(), SessionStatus::Expired);
        s.close();
        assert_eq!(s.status(), SessionStatus::Expired);
        // Heartbeats after expiry change nothing.
        s.heartbeat(LogTime::new(5_000));
        assert!(!s.is_expired_at(LogTime::new(10_000)));
        assert_eq!(s.status(), SessionStatus::Expired);
    }

    #[test]
    fn command_cache_trims_on_ack() {
        let mut s = session();
        s.complete_command(1, OperationResult::ok(11, 0, "a"));
        s.complete_command(2, OperationResult::ok(12, 0, "b"));
        s.complete_command(3, OperationResult::ok(13, 0, "c"));
        assert_eq!(s.command_sequence(), 3);
        assert_eq!(s.cached_result_count(), 3);

        s.ack_commands(2);
        assert!(s.cached_result(1).is_none());
        assert!(s.cached_result(2).is_none());
        assert!(s.cached_result(3).is_some());
    }

    #[test]
    fn event_queue_trims_on_ack() {
        let mut s = session();
        s.queue_events(11, vec![Bytes::from_static(b"e1")]);
        s.queue_events(13, vec![Bytes::from_static(b"e2")]);
        assert_eq!(s.last_event_index(), 13);
        assert_eq!(s.pending_event_count(), 2);

        s.ack_events(11);
        assert_eq!(s.pending_event_count(), 1);
        assert_eq!(s.pending_events().next().unwrap().index, 13);
        assert_eq!(s.event_ack_index(), 11);
    }

    #[test]
    fn empty_event_batches_are_not_queued() {
        let mut s = session();
        s.queue_events(11, vec![]);
        assert_eq!(s.pending_event_count(), 0);
        assert_eq!(s.last_event_index(), 0);
    }
}
