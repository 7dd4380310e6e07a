//! Deterministic application of committed entries.

pub mod compactor;
pub mod engine;

pub use compactor::Compactor;
pub use engine::{ApplyEngine, ApplyOutcome};
