//! Committed log access.
//!
//! The consensus core owns replication; the runtime sees it through
//! [`CommittedLog`]: an ordered, committed entry sequence that can report and
//! perform compaction. [`InMemoryLog`] is the in-process implementation used
//! by the local server runtime and by tests, with the leader-side append path
//! enforcing timestamp monotonicity.

use crate::core::error::{RaftError, RaftResult};
use crate::core::time::LogTime;
use crate::log::entry::{Entry, EntryPayload, Indexed};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Read surface of the committed, ordered log.
pub trait CommittedLog: Send + Sync {
    /// Index of the first retained entry (1 on a fresh log).
    fn first_index(&self) -> u64;

    /// Index of the last committed entry (0 when empty).
    fn last_index(&self) -> u64;

    /// Fetch the entry at `index`, if retained and committed.
    fn get(&self, index: u64) -> Option<Indexed>;

    /// Whether entries at or below `index` may be truncated.
    fn is_compactable(&self, index: u64) -> bool;

    /// The highest truncatable index at or below `index`.
    fn compactable_index(&self, index: u64) -> u64;

    /// Truncate all entries at or below `index`.
    fn compact(&mut self, index: u64);
}

/// Shared handle to the committed log.
pub type SharedLog = Arc<RwLock<dyn CommittedLog>>;

// ============================================================================
// In-memory log
// ============================================================================

/// In-process committed log.
///
/// Stands in for the consensus core's log: the local server appends as
/// leader, the apply engine reads committed entries, the compactor truncates.
#[derive(Debug)]
pub struct InMemoryLog {
    entries: VecDeque<Indexed>,
    first_index: u64,
    last_timestamp: LogTime,
}

impl InMemoryLog {
    /// Create an empty log starting at index 1.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            last_timestamp: LogTime::zero(),
        }
    }

    /// Create a shared handle around a fresh log.
    pub fn shared() -> Arc<RwLock<InMemoryLog>> {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Append an entry as leader, assigning the next index.
    ///
    /// The timestamp is clamped so committed entries stay monotonic even if
    /// the clock steps backwards.
    pub fn append(&mut self, term: u64, timestamp: LogTime, payload: EntryPayload) -> u64 {
        let timestamp = timestamp.max(self.last_timestamp.add_ms(1));
        self.last_timestamp = timestamp;
        let index = self.last_index() + 1;
        self.entries.push_back(Indexed {
            index,
            entry: Entry {
                term,
                timestamp,
                payload,
            },
        });
        index
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log retains no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode an entry for durable storage or transfer.
    pub fn encode_entry(entry: &Indexed) -> Result<Vec<u8>> {
        bincode::serialize(entry).context("failed to serialize log entry")
    }

    /// Decode an entry previously produced by [`InMemoryLog::encode_entry`].
    pub fn decode_entry(bytes: &[u8]) -> Result<Indexed> {
        bincode::deserialize(bytes).context("failed to deserialize log entry")
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommittedLog for InMemoryLog {
    fn first_index(&self) -> u64 {
        self.first_index
    }

    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    fn get(&self, index: u64) -> Option<Indexed> {
        if index < self.first_index {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset).cloned()
    }

    fn is_compactable(&self, index: u64) -> bool {
        self.compactable_index(index) >= self.first_index
    }

    fn compactable_index(&self, index: u64) -> u64 {
        index.min(self.last_index())
    }

    fn compact(&mut self, index: u64) {
        while self.first_index <= index && !self.entries.is_empty() {
            self.entries.pop_front();
            self.first_index += 1;
        }
        if self.entries.is_empty() {
            self.first_index = index + 1;
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Monotonic reader over a shared committed log.
///
/// Supplies `(index, entry)` strictly in order. The cursor tracks its own
/// next index; compaction beneath it is invisible because applied entries are
/// never re-read.
pub struct LogReader {
    log: SharedLog,
    next_index: u64,
}

impl LogReader {
    /// Open a reader at the log's first index.
    pub fn new(log: SharedLog) -> Self {
        let next_index = log.read().first_index();
        Self { log, next_index }
    }

    /// Open a reader positioned at `next_index`.
    pub fn at(log: SharedLog, next_index: u64) -> Self {
        Self { log, next_index }
    }

    /// The index the next read will return.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// The log's current first retained index.
    pub fn first_index(&self) -> u64 {
        self.log.read().first_index()
    }

    /// Whether an entry is available at the cursor.
    pub fn has_next(&self) -> bool {
        self.log.read().last_index() >= self.next_index
    }

    /// Read the next committed entry and advance.
    pub fn read_next(&mut self) -> Option<Indexed> {
        let entry = self.log.read().get(self.next_index)?;
        self.next_index += 1;
        Some(entry)
    }

    /// Reposition the cursor (after snapshot install).
    pub fn seek(&mut self, next_index: u64) {
        self.next_index = next_index;
    }

    /// Fail if the cursor cannot legally apply `next_index` given
    /// `last_applied`.
    pub fn check_sequential(&self, last_applied: u64) -> RaftResult<()> {
        let next = self.next_index;
        if next > last_applied + 1 && next != self.first_index() {
            return Err(RaftError::NonSequential { next, last_applied });
        }
        if next < last_applied {
            return Err(RaftError::DuplicateApply { next, last_applied });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_log(entries: usize) -> Arc<RwLock<InMemoryLog>> {
        let log = InMemoryLog::shared();
        {
            let mut guard = log.write();
            for i in 0..entries {
                guard.append(1, LogTime::new(i as u64 * 10), EntryPayload::Initialize);
            }
        }
        log
    }

    #[test]
    fn append_assigns_sequential_indexes() {
        let log = noop_log(3);
        let guard = log.read();
        assert_eq!(guard.first_index(), 1);
        assert_eq!(guard.last_index(), 3);
        assert_eq!(guard.get(2).unwrap().index, 2);
        assert!(guard.get(4).is_none());
    }

    #[test]
    fn timestamps_stay_monotonic() {
        let log = InMemoryLog::shared();
        let mut guard = log.write();
        guard.append(1, LogTime::new(100), EntryPayload::Initialize);
        // Clock steps backwards; the appended timestamp must not.
        guard.append(1, LogTime::new(50), EntryPayload::Initialize);
        let ts1 = guard.get(1).unwrap().timestamp();
        let ts2 = guard.get(2).unwrap().timestamp();
        assert!(ts2 > ts1);
    }

    #[test]
    fn compact_drops_prefix() {
        let log = noop_log(5);
        {
            let mut guard = log.write();
            assert!(guard.is_compactable(3));
            guard.compact(3);
        }
        let guard = log.read();
        assert_eq!(guard.first_index(), 4);
        assert!(guard.get(3).is_none());
        assert_eq!(guard.get(4).unwrap().index, 4);
    }

    #[test]
    fn reader_walks_in_order() {
        let log = noop_log(3);
        let mut reader = LogReader::new(log);
        assert_eq!(reader.read_next().unwrap().index, 1);
        assert_eq!(reader.read_next().unwrap().index, 2);
        assert_eq!(reader.read_next().unwrap().index, 3);
        assert!(reader.read_next().is_none());
    }

    #[test]
    fn sequential_check() {
        let log = noop_log(5);
        let reader = LogReader::at(log.clone(), 4);
        // last_applied = 1 would mean skipping 2 and 3.
        assert!(matches!(
            reader.check_sequential(1),
            Err(RaftError::NonSequential { next: 4, .. })
        ));
        // last_applied = 5 would mean re-applying 4.
        assert!(matches!(
            reader.check_sequential(5),
            Err(RaftError::DuplicateApply { next: 4, .. })
        ));
        assert!(reader.check_sequential(3).is_ok());

        // The first retained entry is always legal (snapshot catch-up).
        log.write().compact(3);
        let reader = LogReader::new(log);
        assert_eq!(reader.next_index(), 4);
        assert!(reader.check_sequential(0).is_ok());
    }

    #[test]
    fn entry_encoding_round_trip() {
        let log = noop_log(1);
        let entry = log.read().get(1).unwrap();
        let bytes = InMemoryLog::encode_entry(&entry).unwrap();
        let decoded = InMemoryLog::decode_entry(&bytes).unwrap();
        assert_eq!(decoded.index, 1);
    }
}
