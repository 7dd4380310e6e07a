//! Conclave - replicated state-machine runtime over an external Raft core.
//!
//! A cluster of servers maintains a consistent, ordered log of client
//! operations and applies them to user-supplied deterministic services,
//! returning results to clients with configurable linearizability. The
//! consensus layer proper (election, replication) is an external
//! collaborator exposing a committed, ordered log and a last-applied index;
//! conclave supplies everything above it:
//!
//! - the **apply side**: a strict-order apply engine dispatching committed
//!   entries to per-service state machines, session lifecycle driven by log
//!   entries, and snapshot-gated log compaction;
//! - the **client side**: a single-task dispatcher that discovers the
//!   leader, registers a session, retries across the cluster, and preserves
//!   per-session command ordering and event delivery.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RaftClient                           │
//! │   register │ keep-alive │ command/query retry │ events      │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ wire protocol
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    LocalServer (leader)                     │
//! │        request → log entry → apply → response/publish       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ committed entries
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ApplyEngine + ServiceContexts               │
//! │   sessions │ dedup cache │ event queues │ snapshots         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────────────────────────────────────┐
//! │            External consensus core (committed log)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key invariants
//!
//! - Entries apply in strictly increasing index order, exactly once.
//! - Per session, commands execute in strictly increasing sequence; a
//!   duplicate sequence replays the cached result.
//! - Events published at index `i` reach the client exactly once, in order,
//!   before any result whose event horizon is `i`.
//! - Session expiry is decided only from entry timestamps, never from the
//!   wall clock.

// Core infrastructure
pub mod core;

// Cluster membership metadata
pub mod cluster;

// Committed log entries and access
pub mod log;

// Server-side sessions
pub mod session;

// User services and their execution environments
pub mod service;

// The apply engine and compactor
pub mod apply;

// Durable snapshots
pub mod storage;

// Client-facing wire messages
pub mod protocol;

// The cluster client
pub mod client;

// Server-side runtime
pub mod runtime;

// Re-exports for convenience
pub use self::core::{config, error, time};
pub use apply::{ApplyEngine, ApplyOutcome, Compactor};
pub use client::{RaftClient, SessionEvent};
pub use cluster::{ClusterView, Member, MemberId, MemberRole};
pub use config::{ClientConfig, Config, ReadConsistency, ServerConfig, SessionConfig};
pub use error::{ErrorCode, RaftError, RaftResult, RetryAction};
pub use log::{Entry, EntryPayload, Indexed, Operation, OperationResult};
pub use runtime::{LocalServer, LoopbackTransport, ServiceManager};
pub use service::{CommandContext, EventSink, Service, ServiceError, ServiceRegistry};
pub use session::{SessionMetadata, SessionState, SessionTable};
pub use storage::{ServiceSnapshot, SnapshotStore};
pub use time::{LogClock, LogTime, ManualClock, WallClock};
