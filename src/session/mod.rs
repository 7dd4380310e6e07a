//! Server-side sessions: per-session state and the id-ordered table.

pub mod state;
pub mod table;

use serde::{Deserialize, Serialize};

pub use state::{EventBatch, SessionState, SessionStatus};
pub use table::SessionTable;

/// Client-visible description of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: u64,
    pub service_name: String,
    pub service_type: String,
}

impl From<&SessionState> for SessionMetadata {
    fn from(session: &SessionState) -> Self {
        Self {
            session_id: session.id(),
            service_name: session.service_name().to_string(),
            service_type: session.service_type().to_string(),
        }
    }
}

/// Result of a metadata inquiry: a snapshot copy, safe to hand to other
/// execution contexts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResult {
    pub sessions: Vec<SessionMetadata>,
}
