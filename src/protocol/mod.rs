//! Client-facing wire messages.
//!
//! Names are semantic; the encoding is whatever the transport chooses (the
//! types are serde-ready). Every response carries a status plus whatever view
//! refresh the server can offer, so clients converge on the current leader
//! as a side effect of any exchange.

use crate::cluster::{Member, MemberId};
use crate::core::config::ReadConsistency;
use crate::core::error::{ErrorCode, RaftError, RaftResult};
use crate::log::entry::{Operation, OperationResult};
use crate::session::SessionMetadata;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Outcome marker on every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error { code: ErrorCode, message: String },
}

impl ResponseStatus {
    /// Build the error status for a typed error.
    pub fn error(err: &RaftError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.wire_message(),
        }
    }

    /// Turn the status back into a typed result.
    pub fn as_result(&self) -> RaftResult<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Error { code, message } => Err(RaftError::from_wire(*code, message)),
        }
    }

    /// Whether the status is `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

// ============================================================================
// Register
// ============================================================================

/// Open a session for this client against a named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_id: String,
    pub service_name: String,
    pub service_type: String,
    pub read_consistency: ReadConsistency,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: ResponseStatus,
    pub session_id: u64,
    pub term: u64,
    pub leader: Option<MemberId>,
    pub members: Vec<Member>,
}

// ============================================================================
// Keep-alive
// ============================================================================

/// Refresh a session and acknowledge received results and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: u64,
    /// Highest command sequence whose response the client has received.
    pub command_sequence: u64,
    /// Highest event index the client has observed.
    pub event_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub status: ResponseStatus,
    pub term: u64,
    pub leader: Option<MemberId>,
    pub members: Vec<Member>,
}

// ============================================================================
// Command / query
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session_id: u64,
    /// Per-session sequence number; retransmits reuse it.
    pub request_id: u64,
    /// Client's observed version at submit time.
    pub version: u64,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub result: Option<OperationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session_id: u64,
    /// Client's observed version; sequential reads wait for it.
    pub version: u64,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub result: Option<OperationResult>,
}

// ============================================================================
// Unregister
// ============================================================================

/// Close a session explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub status: ResponseStatus,
}

// ============================================================================
// Metadata
// ============================================================================

/// Session metadata inquiry. A zero session id asks cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub status: ResponseStatus,
    pub sessions: Vec<SessionMetadata>,
}

// ============================================================================
// Event push
// ============================================================================

/// Server-to-client push of events published at one log index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub session_id: u64,
    /// Index of the entry that produced the events.
    pub event_index: u64,
    pub events: Vec<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        assert!(ResponseStatus::Ok.as_result().is_ok());

        let err = RaftError::UnknownSession(9);
        let status = ResponseStatus::error(&err);
        assert_eq!(status.as_result().unwrap_err(), err);

        let err = RaftError::NoLeader;
        let status = ResponseStatus::error(&err);
        assert_eq!(status.as_result().unwrap_err(), err);
    }
}
