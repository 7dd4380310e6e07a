//! Durable state: per-service snapshots.
//!
//! The replicated log itself is owned by the consensus core; the runtime
//! persists only snapshots, keyed by the log index they were taken at.

pub mod snapshot;

pub use snapshot::{ServiceSnapshot, SnapshotStore};
