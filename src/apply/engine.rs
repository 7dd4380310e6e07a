//! The apply engine.
//!
//! Consumes committed entries in strict index order and produces the results
//! the consensus layer forwards to replying servers. The engine owns the
//! session table and all service contexts; nothing else mutates them.
//!
//! Failure discipline: a non-sequential or duplicate apply means the
//! committed sequence itself is corrupt, so the engine halts and refuses all
//! further work. Unknown sessions or services are operation-level outcomes
//! reported upward while apply continues, and service failures become
//! application-error results without disturbing the session.

use crate::core::error::{RaftError, RaftResult};
use crate::core::time::LogTime;
use crate::log::entry::{EntryPayload, Indexed, Operation, OperationResult};
use crate::log::store::{LogReader, SharedLog};
use crate::service::context::{Publishes, ServiceContext};
use crate::service::{ServiceError, ServiceRegistry, ServiceResult};
use crate::session::{MetadataResult, SessionState, SessionTable};
use crate::storage::snapshot::ServiceSnapshot;
use std::collections::HashMap;

/// What applying a single entry produced.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// Entries with no reply (Initialize, Configuration, CloseSession).
    None,
    /// OpenSession: the assigned session id.
    Session(u64),
    /// KeepAlive: the session ids that were still live.
    LiveSessions(Vec<u64>),
    /// Command or query result.
    Operation(OperationResult),
    /// Metadata inquiry result.
    Metadata(MetadataResult),
    /// Operation-level failure, reported upward without halting apply.
    Failure(RaftError),
}

/// Single-threaded applier of committed log entries.
pub struct ApplyEngine {
    reader: LogReader,
    last_applied: u64,
    halted: Option<RaftError>,
    sessions: SessionTable,
    services: HashMap<String, ServiceContext>,
    registry: ServiceRegistry,
    outbox: Publishes,
}

impl ApplyEngine {
    /// Create an engine reading from the shared committed log.
    pub fn new(log: SharedLog, registry: ServiceRegistry) -> Self {
        Self {
            reader: LogReader::new(log),
            last_applied: 0,
            halted: None,
            sessions: SessionTable::new(),
            services: HashMap::new(),
            registry,
            outbox: Vec::new(),
        }
    }

    /// Index of the last applied entry.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The fatal error that halted the engine, if any.
    pub fn halted(&self) -> Option<&RaftError> {
        self.halted.as_ref()
    }

    /// Read access to a session (for query gating and inspection).
    pub fn session(&self, id: u64) -> Option<&SessionState> {
        self.sessions.get(id)
    }

    /// Read access to a service context.
    pub fn service(&self, name: &str) -> Option<&ServiceContext> {
        self.services.get(name)
    }

    /// Names of live services.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drain events queued for live delivery since the last call.
    pub fn take_publishes(&mut self) -> Publishes {
        std::mem::take(&mut self.outbox)
    }

    fn check_halted(&self) -> RaftResult<()> {
        match &self.halted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn halt(&mut self, err: &RaftError) {
        tracing::error!(error = %err, "apply engine halted");
        self.halted = Some(err.clone());
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Apply every committed entry up to and including `index`, discarding
    /// results. Fire-and-forget: indexes beyond the committed tail are
    /// simply not reached yet.
    pub fn apply_all(&mut self, index: u64) -> RaftResult<()> {
        self.check_halted()?;
        while self.reader.has_next() && self.reader.next_index() <= index {
            self.apply_next()?;
        }
        Ok(())
    }

    /// Apply up to and including `index` and return that entry's outcome.
    pub fn apply(&mut self, index: u64) -> RaftResult<ApplyOutcome> {
        self.check_halted()?;
        loop {
            let next = self.reader.next_index();
            if next > index {
                // Already applied past the target; the caller gets no value.
                return Ok(ApplyOutcome::None);
            }
            if !self.reader.has_next() {
                return Err(RaftError::Protocol(format!(
                    "cannot apply index {index}: not committed"
                )));
            }
            let outcome = self.apply_next()?;
            if next == index {
                return Ok(outcome);
            }
        }
    }

    /// Apply exactly the next committed entry.
    fn apply_next(&mut self) -> RaftResult<ApplyOutcome> {
        if let Err(err) = self.reader.check_sequential(self.last_applied) {
            self.halt(&err);
            return Err(err);
        }
        let entry = self.reader.read_next().ok_or_else(|| {
            RaftError::Protocol("committed entry vanished beneath the cursor".to_string())
        })?;
        let index = entry.index;
        let outcome = self.apply_entry(&entry);
        self.last_applied = index;
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Per-kind handlers
    // ------------------------------------------------------------------

    fn apply_entry(&mut self, entry: &Indexed) -> ApplyOutcome {
        let index = entry.index;
        let timestamp = entry.timestamp();
        tracing::trace!(index, kind = entry.entry.payload.kind(), "applying entry");

        match &entry.entry.payload {
            EntryPayload::Initialize | EntryPayload::Configuration { .. } => {
                // A time pulse: prior-term entries are forced to commit and
                // sessions observe monotonic time through leadership churn.
                for service in self.services.values_mut() {
                    service.keep_alive_sessions(index, timestamp);
                }
                ApplyOutcome::None
            }

            EntryPayload::OpenSession {
                client_id,
                service_name,
                service_type,
                read_consistency,
                timeout_ms,
            } => self.apply_open_session(
                index,
                timestamp,
                client_id,
                service_name,
                service_type,
                *read_consistency,
                *timeout_ms,
            ),

            EntryPayload::KeepAlive {
                session_ids,
                command_sequences,
                event_indexes,
            } => self.apply_keep_alive(
                index,
                timestamp,
                session_ids,
                command_sequences,
                event_indexes,
            ),

            EntryPayload::CloseSession { session_id } => {
                self.apply_close_session(index, timestamp, *session_id)
            }

            EntryPayload::Command {
                session_id,
                sequence,
                operation,
            } => self.apply_command(index, timestamp, *session_id, *sequence, operation),

            EntryPayload::Metadata { session_id } => self.apply_metadata(*session_id),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_open_session(
        &mut self,
        index: u64,
        timestamp: LogTime,
        client_id: &str,
        service_name: &str,
        service_type: &str,
        read_consistency: crate::core::config::ReadConsistency,
        timeout_ms: u64,
    ) -> ApplyOutcome {
        if !self.services.contains_key(service_name) {
            let Some(service) = self.registry.create(service_type) else {
                return ApplyOutcome::Failure(RaftError::UnknownService(service_type.to_string()));
            };
            self.services.insert(
                service_name.to_string(),
                ServiceContext::new(index, service_name, service_type, service),
            );
            tracing::debug!(service = service_name, service_id = index, "service created");
        }
        let Some(service) = self.services.get_mut(service_name) else {
            return ApplyOutcome::Failure(RaftError::UnknownService(service_type.to_string()));
        };

        // The session id is the entry index: unique across the cluster with
        // no extra coordination.
        let session = SessionState::new(
            index,
            client_id,
            service_name,
            service_type,
            read_consistency,
            timeout_ms,
            timestamp,
        );
        self.sessions.register(session);

        let publishes = service.open_session(index, timestamp, index, &mut self.sessions);
        self.outbox.extend(publishes);

        tracing::debug!(session = index, service = service_name, "session opened");
        ApplyOutcome::Session(index)
    }

    fn apply_keep_alive(
        &mut self,
        index: u64,
        timestamp: LogTime,
        session_ids: &[u64],
        command_sequences: &[u64],
        event_indexes: &[u64],
    ) -> ApplyOutcome {
        // The live-id list is plain data owned by this context; no executor
        // can observe it mid-aggregation.
        let mut live = Vec::with_capacity(session_ids.len());
        for (i, &session_id) in session_ids.iter().enumerate() {
            let command_sequence = command_sequences.get(i).copied().unwrap_or(0);
            let event_index = event_indexes.get(i).copied().unwrap_or(0);

            let Some(name) = self
                .sessions
                .get_open(session_id)
                .map(|s| s.service_name().to_string())
            else {
                continue;
            };
            if let Some(service) = self.services.get_mut(&name) {
                if service.keep_alive(
                    index,
                    timestamp,
                    &mut self.sessions,
                    session_id,
                    command_sequence,
                    event_index,
                ) {
                    live.push(session_id);
                }
            }
        }

        // Every service then decides expiry against the entry timestamp.
        for service in self.services.values_mut() {
            let publishes = service.complete_keep_alive(index, timestamp, &mut self.sessions);
            self.outbox.extend(publishes);
        }

        ApplyOutcome::LiveSessions(live)
    }

    fn apply_close_session(
        &mut self,
        index: u64,
        timestamp: LogTime,
        session_id: u64,
    ) -> ApplyOutcome {
        let Some(name) = self
            .sessions
            .get_open(session_id)
            .map(|s| s.service_name().to_string())
        else {
            return ApplyOutcome::Failure(RaftError::UnknownSession(session_id));
        };
        if let Some(service) = self.services.get_mut(&name) {
            let publishes = service.close_session(index, timestamp, session_id, &mut self.sessions);
            self.outbox.extend(publishes);
        }
        tracing::debug!(session = session_id, service = %name, "session closed");
        ApplyOutcome::None
    }

    fn apply_command(
        &mut self,
        index: u64,
        timestamp: LogTime,
        session_id: u64,
        sequence: u64,
        operation: &Operation,
    ) -> ApplyOutcome {
        let Some(name) = self
            .sessions
            .get_open(session_id)
            .map(|s| s.service_name().to_string())
        else {
            return ApplyOutcome::Failure(RaftError::UnknownSession(session_id));
        };
        let Some(service) = self.services.get_mut(&name) else {
            return ApplyOutcome::Failure(RaftError::UnknownSession(session_id));
        };
        match service.execute_command(
            index,
            timestamp,
            &mut self.sessions,
            session_id,
            sequence,
            operation,
        ) {
            Ok((result, publishes)) => {
                self.outbox.extend(publishes);
                ApplyOutcome::Operation(result)
            }
            Err(err) => ApplyOutcome::Failure(err),
        }
    }

    fn apply_metadata(&self, session_id: u64) -> ApplyOutcome {
        if session_id > 0 {
            let Some(session) = self.sessions.get(session_id) else {
                return ApplyOutcome::Failure(RaftError::UnknownSession(session_id));
            };
            let service_name = session.service_name().to_string();
            ApplyOutcome::Metadata(MetadataResult {
                sessions: self
                    .sessions
                    .for_service(&service_name)
                    .map(Into::into)
                    .collect(),
            })
        } else {
            ApplyOutcome::Metadata(MetadataResult {
                sessions: self.sessions.iter().map(Into::into).collect(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Queries (out of band)
    // ------------------------------------------------------------------

    /// Apply a query against current state.
    ///
    /// Queries never enter the log: no mutation, no sequence advance, no
    /// events.
    pub fn query(&self, session_id: u64, operation: &Operation) -> RaftResult<OperationResult> {
        self.check_halted()?;
        let session = self
            .sessions
            .get_open(session_id)
            .ok_or(RaftError::UnknownSession(session_id))?;
        let service = self
            .services
            .get(session.service_name())
            .ok_or(RaftError::UnknownSession(session_id))?;
        service.execute_query(&self.sessions, session_id, operation)
    }

    // ------------------------------------------------------------------
    // Snapshots and compaction support
    // ------------------------------------------------------------------

    /// Snapshot every service at its current applied index.
    pub fn snapshot_services(&mut self) -> ServiceResult<Vec<ServiceSnapshot>> {
        let mut snapshots = Vec::with_capacity(self.services.len());
        for service in self.services.values_mut() {
            snapshots.push(service.take_snapshot(&self.sessions)?);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    /// Mark a service's snapshot at `index` durable.
    pub fn complete_snapshot(&mut self, name: &str, index: u64) {
        if let Some(service) = self.services.get_mut(name) {
            service.complete_snapshot(index);
        }
    }

    /// Record that the log was truncated at or below `index`: drop terminal
    /// sessions it referenced and destroy services with no remaining
    /// references.
    pub fn compacted(&mut self, index: u64) {
        let purged = self.sessions.purge_terminal(index);
        if purged > 0 {
            tracing::debug!(purged, index, "terminal sessions released");
        }
        let sessions = &self.sessions;
        self.services.retain(|name, service| {
            let keep = service.service_id() > index || sessions.for_service(name).next().is_some();
            if !keep {
                tracing::debug!(service = %name, "service destroyed after compaction");
            }
            keep
        });
    }

    /// Rebuild one service (and its sessions) from a snapshot, then position
    /// the cursor to resume from the log tail.
    pub fn install_snapshot(&mut self, snapshot: &ServiceSnapshot) -> RaftResult<()> {
        let service = self
            .registry
            .create(&snapshot.service_type)
            .ok_or_else(|| RaftError::UnknownService(snapshot.service_type.clone()))?;
        let context = ServiceContext::from_snapshot(snapshot, service)
            .map_err(|ServiceError(msg)| RaftError::Application(msg))?;
        self.services.insert(snapshot.name.clone(), context);
        for session in &snapshot.sessions {
            self.sessions.register(session.clone());
        }
        if snapshot.index > self.last_applied {
            self.last_applied = snapshot.index;
            self.reader.seek(snapshot.index + 1);
        }
        tracing::info!(
            service = %snapshot.name,
            index = snapshot.index,
            sessions = snapshot.sessions.len(),
            "snapshot installed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("last_applied", &self.last_applied)
            .field("sessions", &self.sessions.len())
            .field("services", &self.services.len())
            .field("halted", &self.halted)
            .finish()
    }
}
