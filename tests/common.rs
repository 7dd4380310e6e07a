//! Common test utilities.
//!
//! Shared helpers for integration tests: a deterministic test service, a
//! registry wired with instrumentation counters, server/client builders with
//! test-sized timeouts, and a transport wrapper that can take members down.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use bytes::Bytes;
use conclave::client::ClientTransport;
use conclave::cluster::{Member, MemberId};
use conclave::config::{ClientConfig, ServerConfig, SessionConfig};
use conclave::core::error::{RaftError, RaftResult};
use conclave::log::Operation;
use conclave::runtime::{LocalServer, LoopbackTransport};
use conclave::service::{
    CommandContext, EventSink, Service, ServiceError, ServiceRegistry, ServiceResult,
};
use conclave::time::ManualClock;
use conclave::client::ClientConnection;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters the test service reports into, shared with the test body.
#[derive(Debug, Default)]
pub struct ServiceProbe {
    pub executions: AtomicUsize,
    pub expirations: AtomicUsize,
    pub closes: AtomicUsize,
}

impl ServiceProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::Acquire)
    }

    pub fn expirations(&self) -> usize {
        self.expirations.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

/// Deterministic test state machine.
///
/// Operations:
/// - command `write`: records the entry index, returns it as decimal text
/// - command `set` (payload `key=value`): stores a pair, returns the index
/// - command `event` (payload p): publishes p to the calling session
/// - command `broadcast` (payload p): publishes p to every open session
/// - command `fail`: returns a service error
/// - query `read`: returns the last written index as decimal text
/// - query `get` (payload key): returns the stored value
pub struct TestService {
    last_index: u64,
    store: BTreeMap<String, String>,
    probe: Arc<ServiceProbe>,
}

#[derive(Serialize, Deserialize)]
struct TestServiceState {
    last_index: u64,
    store: BTreeMap<String, String>,
}

impl TestService {
    pub fn new(probe: Arc<ServiceProbe>) -> Self {
        Self {
            last_index: 0,
            store: BTreeMap::new(),
            probe,
        }
    }
}

impl Service for TestService {
    fn expire_session(&mut self, _session_id: u64, _events: &mut EventSink) {
        self.probe.expirations.fetch_add(1, Ordering::AcqRel);
    }

    fn close_session(&mut self, _session_id: u64, _events: &mut EventSink) {
        self.probe.closes.fetch_add(1, Ordering::AcqRel);
    }

    fn apply_command(
        &mut self,
        ctx: &CommandContext,
        operation: &Operation,
        events: &mut EventSink,
    ) -> ServiceResult<Bytes> {
        self.probe.executions.fetch_add(1, Ordering::AcqRel);
        self.last_index = ctx.index;
        match operation.id.name.as_str() {
            "write" => Ok(index_bytes(ctx.index)),
            "set" => {
                let payload = String::from_utf8_lossy(&operation.payload);
                let (key, value) = payload
                    .split_once('=')
                    .ok_or_else(|| ServiceError::from("set payload must be key=value"))?;
                self.store.insert(key.to_string(), value.to_string());
                Ok(index_bytes(ctx.index))
            }
            "event" => {
                events.publish(operation.payload.clone());
                Ok(index_bytes(ctx.index))
            }
            "broadcast" => {
                events.broadcast(operation.payload.clone());
                Ok(index_bytes(ctx.index))
            }
            "fail" => Err(ServiceError::from("injected failure")),
            other => Err(ServiceError(format!("unknown command {other}"))),
        }
    }

    fn apply_query(&self, operation: &Operation) -> ServiceResult<Bytes> {
        match operation.id.name.as_str() {
            "read" => Ok(index_bytes(self.last_index)),
            "get" => {
                let key = String::from_utf8_lossy(&operation.payload);
                match self.store.get(key.as_ref()) {
                    Some(value) => Ok(Bytes::from(value.clone())),
                    None => Err(ServiceError::from("key not found")),
                }
            }
            other => Err(ServiceError(format!("unknown query {other}"))),
        }
    }

    fn snapshot(&self) -> ServiceResult<Vec<u8>> {
        let state = TestServiceState {
            last_index: self.last_index,
            store: self.store.clone(),
        };
        bincode::serialize(&state).map_err(|e| ServiceError(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> ServiceResult<()> {
        let state: TestServiceState =
            bincode::deserialize(data).map_err(|e| ServiceError(e.to_string()))?;
        self.last_index = state.last_index;
        self.store = state.store;
        Ok(())
    }
}

pub fn index_bytes(index: u64) -> Bytes {
    Bytes::from(index.to_string())
}

pub fn parse_index(bytes: &Bytes) -> u64 {
    String::from_utf8_lossy(bytes).parse().expect("decimal index")
}

/// Registry with the `test` service type wired to a probe.
pub fn test_registry(probe: &Arc<ServiceProbe>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    let probe = probe.clone();
    registry.register("test", move || TestService::new(probe.clone()));
    registry
}

pub fn member_a() -> Member {
    Member::active("a", "127.0.0.1", 5001)
}

/// Server config pointed at a fresh snapshot directory.
pub fn server_config(dir: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        compact_interval_ms: 3_600_000, // compaction driven manually in tests
        snapshot_dir: dir.path().to_string_lossy().into_owned(),
    }
}

/// Client config with test-sized timeouts.
pub fn client_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 500,
        keep_alive_interval_ms: 50,
        register_backoff_initial_ms: 25,
        register_backoff_max_ms: 200,
    }
}

/// Session config for the `test` service.
pub fn session_config() -> SessionConfig {
    SessionConfig::new("test", "test").with_timeout_ms(10_000)
}

/// Install a test subscriber honoring `RUST_LOG`. Idempotent.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a single-node server with a manual clock.
pub async fn start_server(
    probe: &Arc<ServiceProbe>,
    dir: &tempfile::TempDir,
    clock: Arc<ManualClock>,
) -> Arc<LocalServer> {
    init_tracing();
    let member = member_a();
    LocalServer::start(
        member.clone(),
        vec![member],
        test_registry(probe),
        &server_config(dir),
        clock,
    )
    .await
    .expect("server start")
}

// ============================================================================
// Flaky transport
// ============================================================================

#[derive(Default)]
struct FlakyState {
    down: RwLock<HashSet<MemberId>>,
    attempts: RwLock<Vec<Instant>>,
}

impl FlakyState {
    fn is_down(&self, id: &MemberId) -> bool {
        self.down.read().contains(id)
    }
}

/// Wraps a transport and refuses traffic to members marked down, including
/// traffic on connections that were opened before the member went dark.
/// Records connection attempt times for backoff assertions.
pub struct FlakyTransport {
    inner: Arc<dyn ClientTransport>,
    state: Arc<FlakyState>,
}

impl FlakyTransport {
    pub fn new(inner: Arc<dyn ClientTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Arc::new(FlakyState::default()),
        })
    }

    pub fn set_down(&self, id: &MemberId, down: bool) {
        if down {
            self.state.down.write().insert(id.clone());
        } else {
            self.state.down.write().remove(id);
        }
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.attempts.read().clone()
    }
}

#[async_trait]
impl ClientTransport for FlakyTransport {
    async fn connect(&self, member: &Member) -> RaftResult<Arc<dyn ClientConnection>> {
        self.state.attempts.write().push(Instant::now());
        if self.state.is_down(&member.id) {
            return Err(RaftError::Transport(format!("member {} is down", member.id)));
        }
        let inner = self.inner.connect(member).await?;
        Ok(Arc::new(FlakyConnection {
            state: self.state.clone(),
            member: member.id.clone(),
            inner,
        }))
    }
}

/// Connection wrapper that re-checks reachability on every request.
pub struct FlakyConnection {
    state: Arc<FlakyState>,
    member: MemberId,
    inner: Arc<dyn ClientConnection>,
}

impl FlakyConnection {
    fn check(&self) -> RaftResult<()> {
        if self.state.is_down(&self.member) {
            return Err(RaftError::Transport(format!(
                "member {} is down",
                self.member
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientConnection for FlakyConnection {
    async fn register(
        &self,
        request: conclave::protocol::RegisterRequest,
    ) -> RaftResult<conclave::protocol::RegisterResponse> {
        self.check()?;
        self.inner.register(request).await
    }

    async fn keep_alive(
        &self,
        request: conclave::protocol::KeepAliveRequest,
    ) -> RaftResult<conclave::protocol::KeepAliveResponse> {
        self.check()?;
        self.inner.keep_alive(request).await
    }

    async fn command(
        &self,
        request: conclave::protocol::CommandRequest,
    ) -> RaftResult<conclave::protocol::CommandResponse> {
        self.check()?;
        self.inner.command(request).await
    }

    async fn query(
        &self,
        request: conclave::protocol::QueryRequest,
    ) -> RaftResult<conclave::protocol::QueryResponse> {
        self.check()?;
        self.inner.query(request).await
    }

    async fn metadata(
        &self,
        request: conclave::protocol::MetadataRequest,
    ) -> RaftResult<conclave::protocol::MetadataResponse> {
        self.check()?;
        self.inner.metadata(request).await
    }

    async fn unregister(
        &self,
        request: conclave::protocol::UnregisterRequest,
    ) -> RaftResult<conclave::protocol::UnregisterResponse> {
        self.check()?;
        self.inner.unregister(request).await
    }

    fn take_events(
        &self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<conclave::protocol::PublishMessage>> {
        self.inner.take_events()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// A loopback transport over a single server, wrapped for fault injection.
pub fn flaky_single(server: Arc<LocalServer>) -> Arc<FlakyTransport> {
    FlakyTransport::new(LoopbackTransport::single(server) as Arc<dyn ClientTransport>)
}
