//! Error taxonomy and retry classification.
//!
//! The same decision table drives retries on the client and error mapping on
//! the server's client-facing protocol. Apply-side invariant violations
//! (`NonSequential`, `DuplicateApply`) are fatal to the applier and must halt
//! progress; everything else is either retried transparently or surfaced to
//! the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common error conditions of the runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RaftError {
    /// No known leader, or an operation that requires one reached a follower.
    #[error("no leader found")]
    NoLeader,

    /// A request did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection to a member failed or was refused.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The referenced session is unknown, expired, or closed.
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    /// No factory is registered for the requested service type.
    #[error("unknown service type: {0}")]
    UnknownService(String),

    /// The user service reported a failure. The session is unaffected.
    #[error("application error: {0}")]
    Application(String),

    /// A message or entry violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client (or runtime) is not open.
    #[error("not open")]
    NotOpen,

    /// The client session is not in the Open state.
    #[error("session not open")]
    SessionNotOpen,

    /// The applier was asked to skip ahead of the committed sequence.
    ///
    /// Surfacing this means state corruption; the server must stop applying.
    #[error("non-sequential apply: next index {next}, last applied {last_applied}")]
    NonSequential { next: u64, last_applied: u64 },

    /// The applier was asked to re-apply an index below `last_applied`.
    ///
    /// Fatal, like [`RaftError::NonSequential`].
    #[error("duplicate apply at index {next}, last applied {last_applied}")]
    DuplicateApply { next: u64, last_applied: u64 },

    /// The runtime is shutting down.
    #[error("shutting down")]
    Shutdown,
}

/// What the dispatcher does with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Reset the sticky member and resubmit the same request.
    Retry,
    /// Expire the local session, re-register, rebuild the request with the
    /// new session id, then resubmit.
    Reregister,
    /// Complete the caller's future with the error.
    Fail,
}

impl RaftError {
    /// Classify this error for the client retry loop.
    pub fn retry_action(&self) -> RetryAction {
        match self {
            Self::Timeout | Self::NoLeader | Self::Transport(_) => RetryAction::Retry,
            Self::UnknownSession(_) => RetryAction::Reregister,
            _ => RetryAction::Fail,
        }
    }

    /// Check whether this error is absorbed by the dispatcher retry loop.
    pub fn is_retriable(&self) -> bool {
        matches!(self.retry_action(), RetryAction::Retry)
    }

    /// Check whether this error must halt the apply engine.
    pub fn is_fatal_to_applier(&self) -> bool {
        matches!(
            self,
            Self::NonSequential { .. } | Self::DuplicateApply { .. }
        )
    }
}

/// Result type using [`RaftError`].
pub type RaftResult<T> = Result<T, RaftError>;

// ============================================================================
// Wire mapping
// ============================================================================

/// Wire form of the error taxonomy.
///
/// Responses carry a code plus a free-form message; the client rebuilds the
/// typed error on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoLeader,
    Timeout,
    Transport,
    UnknownSession,
    UnknownService,
    Application,
    Protocol,
    Internal,
}

impl RaftError {
    /// Map to the wire code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoLeader => ErrorCode::NoLeader,
            Self::Timeout => ErrorCode::Timeout,
            Self::Transport(_) => ErrorCode::Transport,
            Self::UnknownSession(_) => ErrorCode::UnknownSession,
            Self::UnknownService(_) => ErrorCode::UnknownService,
            Self::Application(_) => ErrorCode::Application,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::NotOpen
            | Self::SessionNotOpen
            | Self::NonSequential { .. }
            | Self::DuplicateApply { .. }
            | Self::Shutdown => ErrorCode::Internal,
        }
    }

    /// Wire message accompanying [`RaftError::code`].
    pub fn wire_message(&self) -> String {
        match self {
            Self::UnknownSession(id) => id.to_string(),
            Self::UnknownService(name) => name.clone(),
            Self::Application(msg) | Self::Transport(msg) | Self::Protocol(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild a typed error from a wire code and message.
    pub fn from_wire(code: ErrorCode, message: &str) -> Self {
        match code {
            ErrorCode::NoLeader => Self::NoLeader,
            ErrorCode::Timeout => Self::Timeout,
            ErrorCode::Transport => Self::Transport(message.to_string()),
            ErrorCode::UnknownSession => Self::UnknownSession(message.parse().unwrap_or_default()),
            ErrorCode::UnknownService => Self::UnknownService(message.to_string()),
            ErrorCode::Application => Self::Application(message.to_string()),
            ErrorCode::Protocol | ErrorCode::Internal => Self::Protocol(message.to_string()),
        }
    }
}
