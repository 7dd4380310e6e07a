//! Snapshot-then-truncate compaction.
//!
//! On a fixed cadence the compactor checks whether the log can release
//! segments below the last applied index. If so, every service is
//! snapshotted and persisted before the log is truncated, so a replica can
//! always rebuild from snapshot plus tail. Runs are serialized on the apply
//! task: a run must finish before the next cadence tick can start one.

use crate::apply::engine::ApplyEngine;
use crate::log::store::SharedLog;
use crate::storage::snapshot::SnapshotStore;
use anyhow::Result;

/// Periodic log compaction driver.
pub struct Compactor {
    log: SharedLog,
    store: SnapshotStore,
    last_compacted: u64,
}

impl Compactor {
    /// Create a compactor over the shared log and snapshot store.
    pub fn new(log: SharedLog, store: SnapshotStore) -> Self {
        Self {
            log,
            store,
            last_compacted: 0,
        }
    }

    /// Index of the last completed compaction.
    pub fn last_compacted(&self) -> u64 {
        self.last_compacted
    }

    /// The snapshot store backing this compactor.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Run one compaction round if the log has anything to release.
    ///
    /// Returns the truncation index when a round ran.
    pub fn maybe_compact(&mut self, engine: &mut ApplyEngine) -> Result<Option<u64>> {
        let last_applied = engine.last_applied();
        {
            let log = self.log.read();
            if !log.is_compactable(last_applied)
                || log.compactable_index(last_applied) <= self.last_compacted
            {
                return Ok(None);
            }
        }
        self.last_compacted = last_applied;

        // Every snapshot must be durable before anything is truncated.
        let snapshots = engine
            .snapshot_services()
            .map_err(|e| anyhow::anyhow!("snapshot failed: {e}"))?;
        for snapshot in &snapshots {
            self.store.save(snapshot)?;
            engine.complete_snapshot(&snapshot.name, snapshot.index);
            self.store.purge_stale(&snapshot.name)?;
        }

        self.log.write().compact(last_applied);
        engine.compacted(last_applied);

        tracing::info!(
            index = last_applied,
            services = snapshots.len(),
            "log compacted"
        );
        Ok(Some(last_applied))
    }
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("last_compacted", &self.last_compacted)
            .field("dir", &self.store.dir())
            .finish()
    }
}
