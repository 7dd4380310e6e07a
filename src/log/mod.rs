//! Committed log entries, operations, and log access.

pub mod entry;
pub mod store;

pub use entry::{
    Entry, EntryPayload, Indexed, Operation, OperationId, OperationKind, OperationResult,
};
pub use store::{CommittedLog, InMemoryLog, LogReader, SharedLog};
