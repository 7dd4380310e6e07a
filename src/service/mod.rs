//! User-supplied replicated services.
//!
//! A service is a deterministic state machine. The apply engine feeds it
//! committed commands in log order on a single logical thread, so
//! implementations need no locking. Determinism is the contract: given the
//! same entries, every replica must produce the same results and events.

pub mod context;
pub mod registry;

use crate::core::time::LogTime;
use bytes::Bytes;
use thiserror::Error;

pub use context::ServiceContext;
pub use registry::ServiceRegistry;

/// Failure reported by a service implementation.
///
/// Converted to an application-error result; the session is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl From<&str> for ServiceError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for ServiceError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Result type for service callbacks.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Execution context handed to a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext {
    /// Log index of the command entry.
    pub index: u64,
    /// Leader-assigned entry timestamp.
    pub timestamp: LogTime,
    /// Session the command arrived on.
    pub session_id: u64,
}

/// Collector for events published while a service callback runs.
///
/// Events land in session queues tagged with the producing entry's index and
/// are delivered to clients in index order.
#[derive(Debug, Default)]
pub struct EventSink {
    to_session: Vec<Bytes>,
    to_all: Vec<Bytes>,
}

impl EventSink {
    /// Publish an event to the session that triggered the callback.
    pub fn publish(&mut self, payload: impl Into<Bytes>) {
        self.to_session.push(payload.into());
    }

    /// Publish an event to every open session of the service.
    pub fn broadcast(&mut self, payload: impl Into<Bytes>) {
        self.to_all.push(payload.into());
    }

    /// Whether anything was published.
    pub fn is_empty(&self) -> bool {
        self.to_session.is_empty() && self.to_all.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<Bytes>, Vec<Bytes>) {
        (self.to_session, self.to_all)
    }
}

/// A deterministic replicated state machine.
///
/// Callbacks run serialized on the service's logical thread. The lifecycle
/// hooks default to no-ops; most services only implement the two apply
/// methods and the snapshot pair.
pub trait Service: Send {
    /// A session bound to this service was opened.
    fn open_session(&mut self, _session_id: u64, _events: &mut EventSink) {}

    /// A session was closed by the client.
    fn close_session(&mut self, _session_id: u64, _events: &mut EventSink) {}

    /// A session expired without a keep-alive. Runs exactly once per
    /// session; may publish events to surviving sessions.
    fn expire_session(&mut self, _session_id: u64, _events: &mut EventSink) {}

    /// Apply a mutating command.
    fn apply_command(
        &mut self,
        ctx: &CommandContext,
        operation: &crate::log::Operation,
        events: &mut EventSink,
    ) -> ServiceResult<Bytes>;

    /// Apply a read-only query against current state.
    fn apply_query(&self, operation: &crate::log::Operation) -> ServiceResult<Bytes>;

    /// Capture all service state at the current applied index.
    fn snapshot(&self) -> ServiceResult<Vec<u8>>;

    /// Rebuild service state from a snapshot.
    fn restore(&mut self, data: &[u8]) -> ServiceResult<()>;
}
