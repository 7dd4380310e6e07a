//! The client dispatcher.
//!
//! All client state lives on one tokio task; submissions, keep-alive
//! completions, and server event pushes arrive as messages on its mailbox,
//! so per-session sequencing needs no locks. Commands are processed one at a
//! time: a command's retry loop finishes (or fails over to re-registration)
//! before the next submission starts, which is what keeps request ids
//! strictly ordered on the wire.

use crate::client::session::SessionView;
use crate::client::transport::{ClientConnection, ClientTransport};
use crate::cluster::{ClusterView, Member, MemberId};
use crate::core::config::{ClientConfig, SessionConfig};
use crate::core::error::{RaftError, RaftResult, RetryAction};
use crate::log::entry::{Operation, OperationKind, OperationResult};
use crate::protocol::{
    CommandRequest, KeepAliveRequest, KeepAliveResponse, MetadataRequest, PublishMessage,
    QueryRequest, RegisterRequest, RegisterResponse, ResponseStatus, UnregisterRequest,
};
use crate::session::SessionMetadata;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, MissedTickBehavior};

/// An event delivered to the session owner, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Log index of the entry that produced the event.
    pub index: u64,
    pub payload: Bytes,
}

/// A submission from the public handle.
enum ClientOp {
    Command {
        operation: Operation,
        reply: oneshot::Sender<RaftResult<Bytes>>,
    },
    Query {
        operation: Operation,
        reply: oneshot::Sender<RaftResult<Bytes>>,
    },
    Metadata {
        reply: oneshot::Sender<RaftResult<Vec<SessionMetadata>>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Everything that can wake the dispatcher task.
enum DispatcherMsg {
    Op(ClientOp),
    KeepAliveDone(RaftResult<KeepAliveResponse>),
    Publish(PublishMessage),
}

/// Handle to a session-bound client.
///
/// Cloneable; all clones feed the same dispatcher task and session.
#[derive(Clone)]
pub struct RaftClient {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    open: Arc<AtomicBool>,
    session_id: Arc<AtomicU64>,
}

impl RaftClient {
    /// Open a client: register a session against the cluster and start the
    /// keep-alive loop. Resolves once the session is open.
    ///
    /// Returns the handle plus the ordered session event stream.
    pub async fn open(
        transport: Arc<dyn ClientTransport>,
        members: Vec<Member>,
        config: ClientConfig,
        session_config: SessionConfig,
    ) -> RaftResult<(RaftClient, mpsc::UnboundedReceiver<SessionEvent>)> {
        config
            .validate()
            .and_then(|_| session_config.validate())
            .map_err(|e| RaftError::Protocol(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));
        let session_id = Arc::new(AtomicU64::new(0));

        let dispatcher = Dispatcher::new(
            transport,
            members,
            config,
            session_config,
            tx.clone(),
            events_tx,
            open.clone(),
            session_id.clone(),
        );
        tokio::spawn(dispatcher.run(rx, open_tx));

        open_rx.await.map_err(|_| RaftError::Shutdown)??;
        Ok((
            RaftClient {
                tx,
                open,
                session_id,
            },
            events_rx,
        ))
    }

    /// Whether the client is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The current session id (changes after transparent re-registration).
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    /// Submit a command. Retryable failures are absorbed; the future
    /// resolves with the service output or a terminal error.
    pub async fn submit_command(&self, operation: Operation) -> RaftResult<Bytes> {
        self.submit_op(operation, OperationKind::Command).await
    }

    /// Submit a query. Never advances the session version.
    pub async fn submit_query(&self, operation: Operation) -> RaftResult<Bytes> {
        self.submit_op(operation, OperationKind::Query).await
    }

    /// Submit an operation according to its kind.
    pub async fn submit(&self, operation: Operation) -> RaftResult<Bytes> {
        let kind = operation.id.kind;
        self.submit_op(operation, kind).await
    }

    async fn submit_op(&self, operation: Operation, kind: OperationKind) -> RaftResult<Bytes> {
        if !self.is_open() {
            return Err(RaftError::NotOpen);
        }
        let (reply, rx) = oneshot::channel();
        let op = match kind {
            OperationKind::Command => ClientOp::Command { operation, reply },
            OperationKind::Query => ClientOp::Query { operation, reply },
        };
        self.tx
            .send(DispatcherMsg::Op(op))
            .map_err(|_| RaftError::NotOpen)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Fetch metadata for the sessions of this client's service.
    pub async fn metadata(&self) -> RaftResult<Vec<SessionMetadata>> {
        if !self.is_open() {
            return Err(RaftError::NotOpen);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatcherMsg::Op(ClientOp::Metadata { reply }))
            .map_err(|_| RaftError::NotOpen)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Close the client: close the session, stop the keep-alive loop, close
    /// the transport connection.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(DispatcherMsg::Op(ClientOp::Close { reply }))
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// A completed command held back until its events are observed.
struct GatedResult {
    event_index: u64,
    output: RaftResult<Bytes>,
    reply: oneshot::Sender<RaftResult<Bytes>>,
}

struct Dispatcher {
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
    session_config: SessionConfig,
    view: ClusterView,
    /// Sticky peer: the member the current connection is bound to.
    connection: Option<(MemberId, Arc<dyn ClientConnection>)>,
    session: SessionView,
    client_id: String,
    rng: StdRng,
    internal_tx: mpsc::UnboundedSender<DispatcherMsg>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    open_flag: Arc<AtomicBool>,
    session_id_cell: Arc<AtomicU64>,
    keep_alive_inflight: bool,
    last_keep_alive: Instant,
    pending_ops: VecDeque<ClientOp>,
    gated: Vec<GatedResult>,
    close_replies: Vec<oneshot::Sender<()>>,
    closed: bool,
    shut_down: bool,
}

impl Dispatcher {
    fn new(
        transport: Arc<dyn ClientTransport>,
        members: Vec<Member>,
        config: ClientConfig,
        session_config: SessionConfig,
        internal_tx: mpsc::UnboundedSender<DispatcherMsg>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        open_flag: Arc<AtomicBool>,
        session_id_cell: Arc<AtomicU64>,
    ) -> Self {
        let mut rng = StdRng::from_entropy();
        let client_id: String = (0..16).map(|_| format!("{:02x}", rng.gen::<u8>())).collect();
        Self {
            transport,
            config,
            session_config,
            view: ClusterView::new(members),
            connection: None,
            session: SessionView::new(),
            client_id,
            rng,
            internal_tx,
            events_tx,
            open_flag,
            session_id_cell,
            keep_alive_inflight: false,
            last_keep_alive: Instant::now(),
            pending_ops: VecDeque::new(),
            gated: Vec::new(),
            close_replies: Vec::new(),
            closed: false,
            shut_down: false,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<DispatcherMsg>,
        open_tx: oneshot::Sender<RaftResult<()>>,
    ) {
        let result = self.register(&mut rx).await;
        let ok = result.is_ok();
        if ok {
            self.open_flag.store(true, Ordering::Release);
        }
        let _ = open_tx.send(result);
        if !ok {
            self.shutdown().await;
            return;
        }

        let mut tick = tokio::time::interval(Duration::from_millis(
            self.config.keep_alive_interval_ms,
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.closed {
            if let Some(op) = self.pending_ops.pop_front() {
                self.handle_op(op, &mut rx).await;
                continue;
            }
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(DispatcherMsg::Op(op)) => self.handle_op(op, &mut rx).await,
                    Some(DispatcherMsg::KeepAliveDone(result)) => self.finish_keep_alive(result),
                    Some(DispatcherMsg::Publish(msg)) => self.handle_publish(msg),
                    None => break,
                },
                _ = tick.tick() => self.maybe_start_keep_alive(),
            }
        }
        self.shutdown().await;
    }

    async fn handle_op(&mut self, op: ClientOp, rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>) {
        match op {
            ClientOp::Command { operation, reply } => {
                self.handle_command(operation, reply, rx).await
            }
            ClientOp::Query { operation, reply } => self.handle_query(operation, reply, rx).await,
            ClientOp::Metadata { reply } => self.handle_metadata(reply, rx).await,
            ClientOp::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Pull already-queued internal messages without blocking. Submissions
    /// stay queued so their order is preserved.
    fn drain_internal(&mut self, rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>) {
        while let Ok(msg) = rx.try_recv() {
            match msg {
                // A close takes effect immediately so retry loops stop.
                DispatcherMsg::Op(ClientOp::Close { reply }) => {
                    self.closed = true;
                    self.close_replies.push(reply);
                }
                DispatcherMsg::Op(op) => self.pending_ops.push_back(op),
                DispatcherMsg::KeepAliveDone(result) => self.finish_keep_alive(result),
                DispatcherMsg::Publish(publish) => self.handle_publish(publish),
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands and queries
    // ------------------------------------------------------------------

    async fn handle_command(
        &mut self,
        operation: Operation,
        reply: oneshot::Sender<RaftResult<Bytes>>,
        rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>,
    ) {
        if !self.session.is_open() {
            let _ = reply.send(Err(RaftError::SessionNotOpen));
            return;
        }
        let request_id = self.session.next_request_id();
        let mut request = CommandRequest {
            session_id: self.session.id(),
            request_id,
            version: self.session.version(),
            operation,
        };

        loop {
            if self.closed {
                let _ = reply.send(Err(RaftError::NotOpen));
                return;
            }
            self.drain_internal(rx);
            self.maybe_start_keep_alive();

            let Some(member) = self.select_member() else {
                let _ = reply.send(Err(RaftError::NoLeader));
                return;
            };
            match self.try_command(&member, &request).await {
                Ok(result) => {
                    // Commands advance the version; queries never do.
                    self.session.observe_version(request.request_id);
                    let output = result.output.clone().map_err(RaftError::Application);
                    self.complete_or_gate(result, output, reply);
                    return;
                }
                Err(err) => match err.retry_action() {
                    RetryAction::Retry => {
                        tracing::warn!(member = %member.id, error = %err, "command failed, retrying");
                        self.reset_sticky();
                    }
                    RetryAction::Reregister => {
                        if let Err(err) = self.recover_session(rx).await {
                            let _ = reply.send(Err(err));
                            return;
                        }
                        // Rebuild against the new session; the server
                        // sequences it from one.
                        request.session_id = self.session.id();
                        request.request_id = self.session.next_request_id();
                        request.version = self.session.version();
                    }
                    RetryAction::Fail => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                },
            }
        }
    }

    async fn try_command(
        &mut self,
        member: &Member,
        request: &CommandRequest,
    ) -> RaftResult<OperationResult> {
        let connection = self.connection(member).await?;
        let response = timeout(
            Duration::from_millis(self.config.request_timeout_ms),
            connection.command(request.clone()),
        )
        .await
        .map_err(|_| RaftError::Timeout)??;
        response.status.as_result()?;
        response
            .result
            .ok_or_else(|| RaftError::Protocol("command response missing result".to_string()))
    }

    async fn handle_query(
        &mut self,
        operation: Operation,
        reply: oneshot::Sender<RaftResult<Bytes>>,
        rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>,
    ) {
        if !self.session.is_open() {
            let _ = reply.send(Err(RaftError::SessionNotOpen));
            return;
        }
        let mut request = QueryRequest {
            session_id: self.session.id(),
            version: self.session.version(),
            operation,
        };

        loop {
            if self.closed {
                let _ = reply.send(Err(RaftError::NotOpen));
                return;
            }
            self.drain_internal(rx);
            self.maybe_start_keep_alive();

            let Some(member) = self.select_member() else {
                let _ = reply.send(Err(RaftError::NoLeader));
                return;
            };
            match self.try_query(&member, &request).await {
                Ok(result) => {
                    let output = result.output.clone().map_err(RaftError::Application);
                    self.complete_or_gate(result, output, reply);
                    return;
                }
                Err(err) => match err.retry_action() {
                    RetryAction::Retry => {
                        tracing::warn!(member = %member.id, error = %err, "query failed, retrying");
                        self.reset_sticky();
                    }
                    RetryAction::Reregister => {
                        if let Err(err) = self.recover_session(rx).await {
                            let _ = reply.send(Err(err));
                            return;
                        }
                        request.session_id = self.session.id();
                        request.version = self.session.version();
                    }
                    RetryAction::Fail => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                },
            }
        }
    }

    async fn try_query(
        &mut self,
        member: &Member,
        request: &QueryRequest,
    ) -> RaftResult<OperationResult> {
        let connection = self.connection(member).await?;
        let response = timeout(
            Duration::from_millis(self.config.request_timeout_ms),
            connection.query(request.clone()),
        )
        .await
        .map_err(|_| RaftError::Timeout)??;
        response.status.as_result()?;
        response
            .result
            .ok_or_else(|| RaftError::Protocol("query response missing result".to_string()))
    }

    async fn handle_metadata(
        &mut self,
        reply: oneshot::Sender<RaftResult<Vec<SessionMetadata>>>,
        rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>,
    ) {
        if !self.session.is_open() {
            let _ = reply.send(Err(RaftError::SessionNotOpen));
            return;
        }
        loop {
            if self.closed {
                let _ = reply.send(Err(RaftError::NotOpen));
                return;
            }
            self.drain_internal(rx);
            self.maybe_start_keep_alive();

            let Some(member) = self.select_member() else {
                let _ = reply.send(Err(RaftError::NoLeader));
                return;
            };
            let request = MetadataRequest {
                session_id: self.session.id(),
            };
            let outcome: RaftResult<Vec<SessionMetadata>> = async {
                let connection = self.connection(&member).await?;
                let response = timeout(
                    Duration::from_millis(self.config.request_timeout_ms),
                    connection.metadata(request),
                )
                .await
                .map_err(|_| RaftError::Timeout)??;
                response.status.as_result()?;
                Ok(response.sessions)
            }
            .await;
            match outcome {
                Ok(sessions) => {
                    let _ = reply.send(Ok(sessions));
                    return;
                }
                Err(err) => match err.retry_action() {
                    RetryAction::Retry => self.reset_sticky(),
                    RetryAction::Reregister => {
                        if let Err(err) = self.recover_session(rx).await {
                            let _ = reply.send(Err(err));
                            return;
                        }
                    }
                    RetryAction::Fail => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                },
            }
        }
    }

    /// Complete a submission, or hold it until its event horizon is
    /// observed.
    fn complete_or_gate(
        &mut self,
        result: OperationResult,
        output: RaftResult<Bytes>,
        reply: oneshot::Sender<RaftResult<Bytes>>,
    ) {
        if result.event_index <= self.session.event_index() {
            let _ = reply.send(output);
        } else {
            self.gated.push(GatedResult {
                event_index: result.event_index,
                output,
                reply,
            });
        }
    }

    // ------------------------------------------------------------------
    // Session recovery and registration
    // ------------------------------------------------------------------

    /// The server no longer knows the session: expire it locally, release
    /// anything gated on its events, and register a new one.
    async fn recover_session(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>,
    ) -> RaftResult<()> {
        tracing::warn!(session = self.session.id(), "lost session, re-registering");
        self.session.expire();
        self.release_gated();
        self.register(rx).await
    }

    /// Deliver gated results as-is: their events died with the session.
    fn release_gated(&mut self) {
        for gated in self.gated.drain(..) {
            let _ = gated.reply.send(gated.output);
        }
    }

    /// Register a session, retrying with doubling backoff until it
    /// succeeds or the client closes. Single-flight: the dispatcher task
    /// only ever runs one registration at a time.
    async fn register(&mut self, rx: &mut mpsc::UnboundedReceiver<DispatcherMsg>) -> RaftResult<()> {
        let mut backoff = self.config.register_backoff_initial_ms;
        loop {
            self.drain_internal(rx);
            if self.closed {
                return Err(RaftError::Shutdown);
            }
            match self.register_round().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(error = %err, backoff_ms = backoff, "registration failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(self.config.register_backoff_max_ms);
                }
            }
        }
    }

    /// One pass over the member list, uniformly without replacement.
    async fn register_round(&mut self) -> RaftResult<()> {
        let mut candidates = self.view.members().to_vec();
        loop {
            if candidates.is_empty() {
                return Err(RaftError::NoLeader);
            }
            let member = candidates.remove(self.rng.gen_range(0..candidates.len()));
            let request = RegisterRequest {
                client_id: self.client_id.clone(),
                service_name: self.session_config.service_name.clone(),
                service_type: self.session_config.service_type.clone(),
                read_consistency: self.session_config.read_consistency,
                timeout_ms: self.session_config.timeout_ms,
            };
            let outcome: RaftResult<RegisterResponse> = async {
                let connection = self.connection(&member).await?;
                let response = timeout(
                    Duration::from_millis(self.config.request_timeout_ms),
                    connection.register(request),
                )
                .await
                .map_err(|_| RaftError::Timeout)??;
                response.status.as_result()?;
                Ok(response)
            }
            .await;

            match outcome {
                Ok(response) => {
                    self.view
                        .adopt(response.term, response.leader, response.members);
                    self.session.open(response.session_id);
                    self.session_id_cell
                        .store(response.session_id, Ordering::Release);
                    self.last_keep_alive = Instant::now();
                    tracing::debug!(session = response.session_id, "registered new session");
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(member = %member.id, error = %err, "registration attempt failed");
                    self.view.set_leader(None);
                    self.reset_sticky();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Keep-alive
    // ------------------------------------------------------------------

    /// Start a keep-alive if the interval elapsed and none is in flight.
    fn maybe_start_keep_alive(&mut self) {
        if self.keep_alive_inflight || self.closed || !self.session.is_open() {
            return;
        }
        let interval = Duration::from_millis(self.config.keep_alive_interval_ms);
        if self.last_keep_alive.elapsed() < interval {
            return;
        }

        let request = KeepAliveRequest {
            session_id: self.session.id(),
            command_sequence: self.session.version(),
            event_index: self.session.event_index(),
        };
        // Reuse the open connection when there is one; otherwise reach for
        // a random member.
        let connection = self.connection.as_ref().map(|(_, c)| c.clone());
        let member = if connection.is_some() {
            None
        } else {
            self.random_member()
        };
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);

        self.keep_alive_inflight = true;
        self.last_keep_alive = Instant::now();
        tokio::spawn(async move {
            let result = async {
                let connection = match (connection, member) {
                    (Some(connection), _) => connection,
                    (None, Some(member)) => transport.connect(&member).await?,
                    (None, None) => return Err(RaftError::NoLeader),
                };
                timeout(request_timeout, connection.keep_alive(request))
                    .await
                    .map_err(|_| RaftError::Timeout)?
            }
            .await;
            let _ = tx.send(DispatcherMsg::KeepAliveDone(result));
        });
    }

    fn finish_keep_alive(&mut self, result: RaftResult<KeepAliveResponse>) {
        self.keep_alive_inflight = false;
        match result {
            Ok(response) => match response.status {
                ResponseStatus::Ok => {
                    self.view
                        .adopt(response.term, response.leader, response.members);
                }
                ResponseStatus::Error { code, ref message } => {
                    // A lost session is recovered on the next submission,
                    // where re-registration is transparent to the caller.
                    let err = RaftError::from_wire(code, message);
                    tracing::debug!(error = %err, "keep-alive rejected");
                }
            },
            Err(err) => {
                tracing::debug!(error = %err, "keep-alive failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn handle_publish(&mut self, msg: PublishMessage) {
        if msg.session_id != self.session.id() || !self.session.is_open() {
            return;
        }
        // Duplicates (stale forwarders, replays after leader change) are
        // dropped by index.
        if msg.event_index <= self.session.event_index() {
            return;
        }
        self.session.observe_event(msg.event_index);
        for payload in msg.events {
            let _ = self.events_tx.send(SessionEvent {
                index: msg.event_index,
                payload,
            });
        }

        // Events may unblock gated results.
        let observed = self.session.event_index();
        let mut i = 0;
        while i < self.gated.len() {
            if self.gated[i].event_index <= observed {
                let gated = self.gated.swap_remove(i);
                let _ = gated.reply.send(gated.output);
            } else {
                i += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Member selection and connections
    // ------------------------------------------------------------------

    /// Sticky to the connected peer, otherwise uniform random.
    fn select_member(&mut self) -> Option<Member> {
        if let Some((id, _)) = &self.connection {
            if let Some(member) = self.view.member(id) {
                return Some(member.clone());
            }
        }
        self.random_member()
    }

    fn random_member(&mut self) -> Option<Member> {
        let members = self.view.members();
        if members.is_empty() {
            return None;
        }
        Some(members[self.rng.gen_range(0..members.len())].clone())
    }

    /// Drop the sticky peer; the connection closes with it.
    fn reset_sticky(&mut self) {
        if let Some((_, connection)) = self.connection.take() {
            tokio::spawn(async move { connection.close().await });
        }
    }

    /// Connection to the given member, reusing the current one when it
    /// matches. At most one connection is open at a time.
    async fn connection(&mut self, member: &Member) -> RaftResult<Arc<dyn ClientConnection>> {
        if let Some((id, connection)) = &self.connection {
            if id == &member.id {
                return Ok(connection.clone());
            }
        }
        if let Some((_, previous)) = self.connection.take() {
            previous.close().await;
        }
        let connection = self.transport.connect(member).await?;
        if let Some(mut publish_rx) = connection.take_events() {
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = publish_rx.recv().await {
                    if tx.send(DispatcherMsg::Publish(msg)).is_err() {
                        break;
                    }
                }
            });
        }
        self.connection = Some((member.id.clone(), connection.clone()));
        Ok(connection)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.closed = true;
        self.open_flag.store(false, Ordering::Release);
        self.release_gated();
        for op in self.pending_ops.drain(..) {
            match op {
                ClientOp::Command { reply, .. } | ClientOp::Query { reply, .. } => {
                    let _ = reply.send(Err(RaftError::NotOpen));
                }
                ClientOp::Metadata { reply } => {
                    let _ = reply.send(Err(RaftError::NotOpen));
                }
                ClientOp::Close { reply } => {
                    let _ = reply.send(());
                }
            }
        }
        if self.session.is_open() {
            if let Some((_, connection)) = &self.connection {
                let _ = timeout(
                    Duration::from_millis(self.config.request_timeout_ms),
                    connection.unregister(UnregisterRequest {
                        session_id: self.session.id(),
                    }),
                )
                .await;
            }
            self.session.close();
        }
        if let Some((_, connection)) = self.connection.take() {
            connection.close().await;
        }
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
        tracing::debug!("client closed");
    }
}
