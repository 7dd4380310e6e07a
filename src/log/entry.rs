//! Committed log entries and client operations.
//!
//! Every entry carries `(index, term, timestamp)`. Timestamps are
//! leader-assigned and monotonic across committed entries; they are the only
//! time the apply path ever observes. Queries are not log entries, they are
//! carried out-of-band and applied against current state.

use crate::cluster::Member;
use crate::core::config::ReadConsistency;
use crate::core::time::LogTime;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Payload of a committed log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended at the start of a leader's term to force commitment of
    /// prior-term entries and supply a time pulse.
    Initialize,

    /// Membership change, recorded by the consensus core.
    Configuration { members: Vec<Member> },

    /// Open a session against a named service.
    OpenSession {
        client_id: String,
        service_name: String,
        service_type: String,
        read_consistency: ReadConsistency,
        timeout_ms: u64,
    },

    /// Refresh sessions and acknowledge command results and events.
    ///
    /// The three vectors are parallel, one slot per session.
    KeepAlive {
        session_ids: Vec<u64>,
        command_sequences: Vec<u64>,
        event_indexes: Vec<u64>,
    },

    /// Close a session explicitly.
    CloseSession { session_id: u64 },

    /// A state-mutating operation bound to a session.
    Command {
        session_id: u64,
        sequence: u64,
        operation: Operation,
    },

    /// Session metadata inquiry. A zero session id means cluster-wide.
    Metadata { session_id: u64 },
}

impl EntryPayload {
    /// Short kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Configuration { .. } => "configuration",
            Self::OpenSession { .. } => "open-session",
            Self::KeepAlive { .. } => "keep-alive",
            Self::CloseSession { .. } => "close-session",
            Self::Command { .. } => "command",
            Self::Metadata { .. } => "metadata",
        }
    }
}

/// A log entry without its index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub timestamp: LogTime,
    pub payload: EntryPayload,
}

/// An entry paired with its log index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indexed {
    pub index: u64,
    pub entry: Entry,
}

impl Indexed {
    /// The entry timestamp.
    pub fn timestamp(&self) -> LogTime {
        self.entry.timestamp
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Whether an operation mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Mutating; traverses the replicated log.
    Command,
    /// Read-only; never enters the log.
    Query,
}

/// Identifier of an operation: its name plus its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub name: String,
    pub kind: OperationKind,
}

impl OperationId {
    /// A command operation id.
    pub fn command(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Command,
        }
    }

    /// A query operation id.
    pub fn query(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Query,
        }
    }
}

/// A client operation: id plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub payload: Bytes,
}

impl Operation {
    /// Build a command operation.
    pub fn command(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: OperationId::command(name),
            payload: payload.into(),
        }
    }

    /// Build a query operation.
    pub fn query(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: OperationId::query(name),
            payload: payload.into(),
        }
    }

    /// Whether this operation is a query.
    pub fn is_query(&self) -> bool {
        self.id.kind == OperationKind::Query
    }
}

/// Result of applying an operation.
///
/// `event_index` is the index of the last event the caller must observe
/// before this result is surfaced. Results are retained per session until the
/// client acknowledges the sequence, so they must be cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Log index the operation was applied at (0 for queries).
    pub index: u64,
    /// Event horizon the caller must have observed before this result.
    pub event_index: u64,
    /// Service output, or an application error message.
    pub output: Result<Bytes, String>,
}

impl OperationResult {
    /// A successful result.
    pub fn ok(index: u64, event_index: u64, value: impl Into<Bytes>) -> Self {
        Self {
            index,
            event_index,
            output: Ok(value.into()),
        }
    }

    /// An application-error result.
    pub fn error(index: u64, event_index: u64, message: impl Into<String>) -> Self {
        Self {
            index,
            event_index,
            output: Err(message.into()),
        }
    }
}
