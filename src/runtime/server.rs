//! Leader-side request serving.
//!
//! `LocalServer` is the piece the consensus core calls on the leader: it
//! turns client protocol requests into log entries, awaits their
//! application, and maps outcomes back to responses. Running in-process over
//! an [`InMemoryLog`] it doubles as a single-node cluster, which is how the
//! integration tests (and embedded deployments) use it. The loopback
//! transport connects clients straight to a set of local servers.

use crate::client::transport::{ClientConnection, ClientTransport};
use crate::cluster::{ClusterView, Member, MemberId};
use crate::core::config::{ReadConsistency, ServerConfig};
use crate::core::error::{RaftError, RaftResult};
use crate::core::time::LogClock;
use crate::log::entry::EntryPayload;
use crate::log::store::{InMemoryLog, SharedLog};
use crate::protocol::{
    CommandRequest, CommandResponse, KeepAliveRequest, KeepAliveResponse, MetadataRequest,
    MetadataResponse, PublishMessage, QueryRequest, QueryResponse, RegisterRequest,
    RegisterResponse, ResponseStatus, UnregisterRequest, UnregisterResponse,
};
use crate::runtime::manager::ServiceManager;
use crate::service::ServiceRegistry;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a sequential query waits for the session to catch up with the
/// client's observed version.
const SEQUENTIAL_WAIT_MS: u64 = 1_000;

/// An in-process server: log, apply task, and protocol serving.
pub struct LocalServer {
    member: Member,
    term: u64,
    leading: AtomicBool,
    view: RwLock<ClusterView>,
    log: Arc<RwLock<InMemoryLog>>,
    clock: Arc<dyn LogClock>,
    manager: ServiceManager,
}

impl LocalServer {
    /// Start a server as leader of the given view.
    ///
    /// Appends and applies the leader's Initialize entry before returning.
    pub async fn start(
        member: Member,
        members: Vec<Member>,
        registry: ServiceRegistry,
        config: &ServerConfig,
        clock: Arc<dyn LogClock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let log = InMemoryLog::shared();
        let shared: SharedLog = log.clone();
        let manager = ServiceManager::start(shared, registry, config)?;

        let mut view = ClusterView::new(members);
        view.set_term(1);
        view.set_leader(Some(member.id.clone()));

        let server = Arc::new(Self {
            member,
            term: 1,
            leading: AtomicBool::new(true),
            view: RwLock::new(view),
            log,
            clock,
            manager,
        });

        let index = server.append(EntryPayload::Initialize);
        server
            .manager
            .apply(index)
            .await
            .map_err(|e| anyhow::anyhow!("failed to apply initialize entry: {e}"))?;
        tracing::info!(member = %server.member.id, "server started as leader");
        Ok(server)
    }

    /// This server's member record.
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// The apply task handle.
    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    /// The shared in-memory log (the consensus collaborator's surface).
    pub fn log(&self) -> Arc<RwLock<InMemoryLog>> {
        self.log.clone()
    }

    /// Whether this server currently acts as leader.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    /// Flip leadership (tests use this to simulate leader loss).
    pub fn set_leading(&self, leading: bool) {
        self.leading.store(leading, Ordering::Release);
        let mut view = self.view.write();
        if leading {
            let id = self.member.id.clone();
            view.set_leader(Some(id));
        } else {
            view.set_leader(None);
        }
    }

    /// Stop the apply task.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    fn append(&self, payload: EntryPayload) -> u64 {
        self.log.write().append(self.term, self.clock.now(), payload)
    }

    fn view_parts(&self) -> (u64, Option<MemberId>, Vec<Member>) {
        let view = self.view.read();
        (
            view.term(),
            view.leader().map(|m| m.id.clone()),
            view.members().to_vec(),
        )
    }

    // ------------------------------------------------------------------
    // Protocol handlers
    // ------------------------------------------------------------------

    /// Serve a register request: append an OpenSession entry and apply it.
    pub async fn register(&self, request: RegisterRequest) -> RegisterResponse {
        let (term, leader, members) = self.view_parts();
        let respond = |status: ResponseStatus, session_id: u64| RegisterResponse {
            status,
            session_id,
            term,
            leader: leader.clone(),
            members: members.clone(),
        };
        if !self.is_leader() {
            return respond(ResponseStatus::error(&RaftError::NoLeader), 0);
        }
        let index = self.append(EntryPayload::OpenSession {
            client_id: request.client_id,
            service_name: request.service_name,
            service_type: request.service_type,
            read_consistency: request.read_consistency,
            timeout_ms: request.timeout_ms,
        });
        match self.manager.apply(index).await {
            Ok(crate::apply::ApplyOutcome::Session(session_id)) => {
                respond(ResponseStatus::Ok, session_id)
            }
            Ok(crate::apply::ApplyOutcome::Failure(err)) | Err(err) => {
                respond(ResponseStatus::error(&err), 0)
            }
            Ok(_) => respond(
                ResponseStatus::error(&RaftError::Protocol(
                    "unexpected open-session outcome".to_string(),
                )),
                0,
            ),
        }
    }

    /// Serve a keep-alive: append the entry carrying the client's acks.
    pub async fn keep_alive(&self, request: KeepAliveRequest) -> KeepAliveResponse {
        let (term, leader, members) = self.view_parts();
        let respond = |status: ResponseStatus| KeepAliveResponse {
            status,
            term,
            leader: leader.clone(),
            members: members.clone(),
        };
        if !self.is_leader() {
            return respond(ResponseStatus::error(&RaftError::NoLeader));
        }
        let session_id = request.session_id;
        let index = self.append(EntryPayload::KeepAlive {
            session_ids: vec![session_id],
            command_sequences: vec![request.command_sequence],
            event_indexes: vec![request.event_index],
        });
        match self.manager.apply(index).await {
            Ok(crate::apply::ApplyOutcome::LiveSessions(live)) => {
                if live.contains(&session_id) {
                    respond(ResponseStatus::Ok)
                } else {
                    respond(ResponseStatus::error(&RaftError::UnknownSession(session_id)))
                }
            }
            Ok(crate::apply::ApplyOutcome::Failure(err)) | Err(err) => {
                respond(ResponseStatus::error(&err))
            }
            Ok(_) => respond(ResponseStatus::error(&RaftError::Protocol(
                "unexpected keep-alive outcome".to_string(),
            ))),
        }
    }

    /// Serve a command: append the entry and reply with its result.
    pub async fn command(&self, request: CommandRequest) -> CommandResponse {
        if !self.is_leader() {
            return CommandResponse {
                status: ResponseStatus::error(&RaftError::NoLeader),
                result: None,
            };
        }
        let index = self.append(EntryPayload::Command {
            session_id: request.session_id,
            sequence: request.request_id,
            operation: request.operation,
        });
        match self.manager.apply(index).await {
            Ok(crate::apply::ApplyOutcome::Operation(result)) => CommandResponse {
                status: ResponseStatus::Ok,
                result: Some(result),
            },
            Ok(crate::apply::ApplyOutcome::Failure(err)) | Err(err) => CommandResponse {
                status: ResponseStatus::error(&err),
                result: None,
            },
            Ok(_) => CommandResponse {
                status: ResponseStatus::error(&RaftError::Protocol(
                    "unexpected command outcome".to_string(),
                )),
                result: None,
            },
        }
    }

    /// Serve a query at the session's read consistency.
    pub async fn query(&self, request: QueryRequest) -> QueryResponse {
        let error = |err: &RaftError| QueryResponse {
            status: ResponseStatus::error(err),
            result: None,
        };
        let summary = match self.manager.session_info(request.session_id).await {
            Ok(Some(summary)) if summary.open => summary,
            Ok(_) => return error(&RaftError::UnknownSession(request.session_id)),
            Err(err) => return error(&err),
        };

        match summary.read_consistency {
            ReadConsistency::Linearizable | ReadConsistency::LinearizableLease => {
                // Leadership is the lease here; a demoted server must not
                // serve linearizable reads.
                if !self.is_leader() {
                    return error(&RaftError::NoLeader);
                }
            }
            ReadConsistency::Sequential => {
                if let Err(err) = self.wait_for_version(request.session_id, request.version).await {
                    return error(&err);
                }
            }
        }

        match self.manager.query(request.session_id, request.operation).await {
            Ok(result) => QueryResponse {
                status: ResponseStatus::Ok,
                result: Some(result),
            },
            Err(err) => error(&err),
        }
    }

    /// Wait until the session has applied commands up to the client's
    /// observed version, so reads never travel backwards across members.
    async fn wait_for_version(&self, session_id: u64, version: u64) -> RaftResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(SEQUENTIAL_WAIT_MS);
        loop {
            match self.manager.session_info(session_id).await? {
                Some(summary) if summary.open => {
                    if summary.command_sequence >= version {
                        return Ok(());
                    }
                }
                _ => return Err(RaftError::UnknownSession(session_id)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Serve a metadata inquiry through the log so the answer is a
    /// consistent snapshot.
    pub async fn metadata(&self, request: MetadataRequest) -> MetadataResponse {
        if !self.is_leader() {
            return MetadataResponse {
                status: ResponseStatus::error(&RaftError::NoLeader),
                sessions: Vec::new(),
            };
        }
        let index = self.append(EntryPayload::Metadata {
            session_id: request.session_id,
        });
        match self.manager.apply(index).await {
            Ok(crate::apply::ApplyOutcome::Metadata(result)) => MetadataResponse {
                status: ResponseStatus::Ok,
                sessions: result.sessions,
            },
            Ok(crate::apply::ApplyOutcome::Failure(err)) | Err(err) => MetadataResponse {
                status: ResponseStatus::error(&err),
                sessions: Vec::new(),
            },
            Ok(_) => MetadataResponse {
                status: ResponseStatus::error(&RaftError::Protocol(
                    "unexpected metadata outcome".to_string(),
                )),
                sessions: Vec::new(),
            },
        }
    }

    /// Serve an unregister: append a CloseSession entry.
    pub async fn unregister(&self, request: UnregisterRequest) -> UnregisterResponse {
        if !self.is_leader() {
            return UnregisterResponse {
                status: ResponseStatus::error(&RaftError::NoLeader),
            };
        }
        let index = self.append(EntryPayload::CloseSession {
            session_id: request.session_id,
        });
        match self.manager.apply(index).await {
            Ok(crate::apply::ApplyOutcome::Failure(err)) | Err(err) => UnregisterResponse {
                status: ResponseStatus::error(&err),
            },
            Ok(_) => UnregisterResponse {
                status: ResponseStatus::Ok,
            },
        }
    }
}

// ============================================================================
// Loopback transport
// ============================================================================

/// Routes client connections to in-process servers by member id.
#[derive(Default)]
pub struct LoopbackTransport {
    servers: RwLock<HashMap<MemberId, Arc<LocalServer>>>,
}

impl LoopbackTransport {
    /// An empty transport; add servers before connecting.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport routing to a single server.
    pub fn single(server: Arc<LocalServer>) -> Arc<Self> {
        let transport = Self::new();
        transport.add_server(server);
        Arc::new(transport)
    }

    /// Register a server under its member id.
    pub fn add_server(&self, server: Arc<LocalServer>) {
        self.servers
            .write()
            .insert(server.member().id.clone(), server);
    }

    /// Remove a server (simulates an unreachable member).
    pub fn remove_server(&self, id: &MemberId) {
        self.servers.write().remove(id);
    }
}

#[async_trait]
impl ClientTransport for LoopbackTransport {
    async fn connect(&self, member: &Member) -> RaftResult<Arc<dyn ClientConnection>> {
        let server = self
            .servers
            .read()
            .get(&member.id)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("no route to member {}", member.id)))?;
        Ok(Arc::new(LoopbackConnection::new(server)))
    }
}

/// A direct connection to one in-process server.
pub struct LoopbackConnection {
    server: Arc<LocalServer>,
    publish_tx: mpsc::UnboundedSender<PublishMessage>,
    publish_rx: Mutex<Option<mpsc::UnboundedReceiver<PublishMessage>>>,
    subscribed: Mutex<HashSet<u64>>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn new(server: Arc<LocalServer>) -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        Self {
            server,
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            subscribed: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> RaftResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RaftError::Transport("connection closed".to_string()));
        }
        Ok(())
    }

    /// Route the session's event pushes to this connection. Idempotent per
    /// connection; a fresh connection takes the session over, so clients
    /// keep receiving events after a reconnect.
    fn ensure_subscribed(&self, session_id: u64) {
        if self.subscribed.lock().insert(session_id) {
            self.server
                .manager()
                .subscribe_with(session_id, self.publish_tx.clone());
        }
    }
}

#[async_trait]
impl ClientConnection for LoopbackConnection {
    async fn register(&self, request: RegisterRequest) -> RaftResult<RegisterResponse> {
        self.check_open()?;
        let response = self.server.register(request).await;
        if response.status.is_ok() {
            self.ensure_subscribed(response.session_id);
        }
        Ok(response)
    }

    async fn keep_alive(&self, request: KeepAliveRequest) -> RaftResult<KeepAliveResponse> {
        self.check_open()?;
        self.ensure_subscribed(request.session_id);
        Ok(self.server.keep_alive(request).await)
    }

    async fn command(&self, request: CommandRequest) -> RaftResult<CommandResponse> {
        self.check_open()?;
        self.ensure_subscribed(request.session_id);
        Ok(self.server.command(request).await)
    }

    async fn query(&self, request: QueryRequest) -> RaftResult<QueryResponse> {
        self.check_open()?;
        self.ensure_subscribed(request.session_id);
        Ok(self.server.query(request).await)
    }

    async fn metadata(&self, request: MetadataRequest) -> RaftResult<MetadataResponse> {
        self.check_open()?;
        Ok(self.server.metadata(request).await)
    }

    async fn unregister(&self, request: UnregisterRequest) -> RaftResult<UnregisterResponse> {
        self.check_open()?;
        Ok(self.server.unregister(request).await)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PublishMessage>> {
        self.publish_rx.lock().take()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
