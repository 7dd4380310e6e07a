//! Per-service snapshots.
//!
//! A snapshot captures one service and all of its sessions (dedup caches and
//! pending events included) at a log index. Snapshots are written through a
//! temp file and an atomic rename so a crash never leaves a torn snapshot,
//! and the compactor only truncates the log once every snapshot of the round
//! is durable.

use crate::core::time::LogTime;
use crate::session::SessionState;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Everything needed to rebuild one service below a log index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// Index of the OpenSession entry that created the service.
    pub service_id: u64,
    /// Service name.
    pub name: String,
    /// Registered service type.
    pub service_type: String,
    /// Log index the snapshot was taken at.
    pub index: u64,
    /// Newest entry timestamp the service had observed.
    pub current_time: LogTime,
    /// Opaque service-produced state.
    pub state: Vec<u8>,
    /// Sessions bound to the service, terminal ones included.
    pub sessions: Vec<SessionState>,
}

impl ServiceSnapshot {
    /// Encode for storage or transfer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to serialize snapshot")
    }

    /// Decode a snapshot produced by [`ServiceSnapshot::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to deserialize snapshot")
    }
}

/// File-backed snapshot store, one file per `(service, index)`.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// The store's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str, index: u64) -> PathBuf {
        self.dir.join(format!("{name}-{index:020}.snap"))
    }

    /// Persist a snapshot durably. Returns the index it was taken at.
    pub fn save(&self, snapshot: &ServiceSnapshot) -> Result<u64> {
        let bytes = snapshot.encode()?;
        let path = self.path_for(&snapshot.name, snapshot.index);
        let tmp = path.with_extension("snap.tmp");

        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&bytes)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;

        tracing::debug!(
            service = %snapshot.name,
            index = snapshot.index,
            sessions = snapshot.sessions.len(),
            "snapshot persisted"
        );
        Ok(snapshot.index)
    }

    /// Load the newest snapshot for a service, if any.
    pub fn load_latest(&self, name: &str) -> Result<Option<ServiceSnapshot>> {
        let latest = self
            .indexes_for(name)?
            .into_iter()
            .max();
        match latest {
            None => Ok(None),
            Some(index) => {
                let path = self.path_for(name, index);
                let bytes = fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Ok(Some(ServiceSnapshot::decode(&bytes)?))
            }
        }
    }

    /// Load the newest snapshot of every service in the store.
    pub fn load_all_latest(&self) -> Result<Vec<ServiceSnapshot>> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some((name, _)) = parse_file_name(&entry.file_name().to_string_lossy()) {
                if !names.iter().any(|n| n == &name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            if let Some(snapshot) = self.load_latest(&name)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Delete snapshots of a service older than its newest one.
    pub fn purge_stale(&self, name: &str) -> Result<usize> {
        let mut indexes = self.indexes_for(name)?;
        indexes.sort_unstable();
        let Some((_, stale)) = indexes.split_last() else {
            return Ok(0);
        };
        for index in stale {
            let path = self.path_for(name, *index);
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(stale.len())
    }

    fn indexes_for(&self, name: &str) -> Result<Vec<u64>> {
        let mut indexes = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some((n, index)) = parse_file_name(&file_name) {
                if n == name {
                    indexes.push(index);
                }
            }
        }
        Ok(indexes)
    }
}

/// Parse `<name>-<index>.snap` file names.
fn parse_file_name(file_name: &str) -> Option<(String, u64)> {
    let stem = file_name.strip_suffix(".snap")?;
    let (name, index) = stem.rsplit_once('-')?;
    let index: u64 = index.parse().ok()?;
    Some((name.to_string(), index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, index: u64) -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: 1,
            name: name.to_string(),
            service_type: "kv".to_string(),
            index,
            current_time: LogTime::new(index * 10),
            state: vec![1, 2, 3],
            sessions: Vec::new(),
        }
    }

    #[test]
    fn encode_round_trip() {
        let snap = snapshot("test", 42);
        let decoded = ServiceSnapshot::decode(&snap.encode().unwrap()).unwrap();
        assert_eq!(decoded.name, "test");
        assert_eq!(decoded.index, 42);
        assert_eq!(decoded.state, vec![1, 2, 3]);
    }

    #[test]
    fn save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store.save(&snapshot("test", 10)).unwrap();
        store.save(&snapshot("test", 25)).unwrap();
        store.save(&snapshot("other", 12)).unwrap();

        let latest = store.load_latest("test").unwrap().unwrap();
        assert_eq!(latest.index, 25);

        let all = store.load_all_latest().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn purge_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store.save(&snapshot("test", 10)).unwrap();
        store.save(&snapshot("test", 25)).unwrap();
        store.save(&snapshot("test", 40)).unwrap();

        assert_eq!(store.purge_stale("test").unwrap(), 2);
        assert_eq!(store.load_latest("test").unwrap().unwrap().index, 40);
    }

    #[test]
    fn missing_service_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.load_latest("nope").unwrap().is_none());
    }
}
