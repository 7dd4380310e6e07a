//! Snapshot and compaction tests: durable snapshots gate truncation, and a
//! fresh replica rebuilds from snapshot plus log tail.

mod common;

use common::*;
use conclave::apply::{ApplyEngine, ApplyOutcome, Compactor};
use conclave::config::ReadConsistency;
use conclave::log::store::CommittedLog;
use conclave::log::{EntryPayload, InMemoryLog, Operation};
use conclave::storage::SnapshotStore;
use conclave::time::LogTime;
use parking_lot::RwLock;
use std::sync::Arc;

struct Harness {
    log: Arc<RwLock<InMemoryLog>>,
    engine: ApplyEngine,
    compactor: Compactor,
}

impl Harness {
    fn new(probe: &Arc<ServiceProbe>, dir: &tempfile::TempDir) -> Self {
        let log = InMemoryLog::shared();
        let engine = ApplyEngine::new(log.clone(), test_registry(probe));
        let store = SnapshotStore::open(dir.path()).unwrap();
        let compactor = Compactor::new(log.clone(), store);
        Self {
            log,
            engine,
            compactor,
        }
    }

    fn open_session(&mut self, ts: u64) -> u64 {
        let index = self.log.write().append(
            1,
            LogTime::new(ts),
            EntryPayload::OpenSession {
                client_id: "client".to_string(),
                service_name: "test".to_string(),
                service_type: "test".to_string(),
                read_consistency: ReadConsistency::Linearizable,
                timeout_ms: 60_000,
            },
        );
        match self.engine.apply(index).unwrap() {
            ApplyOutcome::Session(id) => id,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn write(&mut self, ts: u64, session: u64, sequence: u64) -> u64 {
        let index = self.log.write().append(
            1,
            LogTime::new(ts),
            EntryPayload::Command {
                session_id: session,
                sequence,
                operation: Operation::command("write", ""),
            },
        );
        match self.engine.apply(index).unwrap() {
            ApplyOutcome::Operation(result) => result.index,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

#[test]
fn compaction_snapshots_then_truncates() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&probe, &dir);

    let session = h.open_session(0);
    for sequence in 1..=10 {
        h.write(sequence * 10, session, sequence);
    }
    let last_applied = h.engine.last_applied();

    let compacted = h.compactor.maybe_compact(&mut h.engine).unwrap();
    assert_eq!(compacted, Some(last_applied));
    assert_eq!(h.log.read().first_index(), last_applied + 1);

    // The snapshot is durable and taken at the truncation index.
    let snapshot = h
        .compactor
        .store()
        .load_latest("test")
        .unwrap()
        .expect("snapshot exists");
    assert_eq!(snapshot.index, last_applied);
    assert_eq!(snapshot.sessions.len(), 1);

    // Nothing new: the next round is a no-op.
    assert_eq!(h.compactor.maybe_compact(&mut h.engine).unwrap(), None);
}

#[test]
fn replica_rebuilds_from_snapshot_plus_tail() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&probe, &dir);

    let session = h.open_session(0);
    for sequence in 1..=5 {
        h.write(sequence * 10, session, sequence);
    }
    h.compactor.maybe_compact(&mut h.engine).unwrap();

    // More traffic lands after the snapshot.
    for sequence in 6..=8 {
        h.write(sequence * 10, session, sequence);
    }
    let last = h.engine.last_applied();

    // A joining server installs the snapshot, then catches up from the tail.
    let replica_probe = ServiceProbe::new();
    let mut replica = ApplyEngine::new(h.log.clone(), test_registry(&replica_probe));
    let store = SnapshotStore::open(dir.path()).unwrap();
    for snapshot in store.load_all_latest().unwrap() {
        replica.install_snapshot(&snapshot).unwrap();
    }
    replica.apply_all(last).unwrap();
    assert_eq!(replica.last_applied(), last);

    // Only the tail executed on the replica.
    assert_eq!(replica_probe.executions(), 3);

    // Service state matches the original and serves queries.
    let original = h
        .engine
        .query(session, &Operation::query("read", ""))
        .unwrap();
    let rebuilt = replica
        .query(session, &Operation::query("read", ""))
        .unwrap();
    assert_eq!(rebuilt.output, original.output);
    assert_eq!(
        replica.session(session).unwrap().command_sequence(),
        h.engine.session(session).unwrap().command_sequence()
    );
}

#[test]
fn restored_dedup_cache_still_replays() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&probe, &dir);

    let session = h.open_session(0);
    for sequence in 1..=3 {
        h.write(sequence * 10, session, sequence);
    }
    h.compactor.maybe_compact(&mut h.engine).unwrap();

    // A retransmit of sequence 3 lands after the snapshot.
    h.log.write().append(
        1,
        LogTime::new(100),
        EntryPayload::Command {
            session_id: session,
            sequence: 3,
            operation: Operation::command("write", ""),
        },
    );
    let last = h.log.read().last_index();

    let replica_probe = ServiceProbe::new();
    let mut replica = ApplyEngine::new(h.log.clone(), test_registry(&replica_probe));
    let store = SnapshotStore::open(dir.path()).unwrap();
    for snapshot in store.load_all_latest().unwrap() {
        replica.install_snapshot(&snapshot).unwrap();
    }
    let outcome = replica.apply(last).unwrap();

    // The cached result survived the snapshot: nothing re-executes.
    match outcome {
        ApplyOutcome::Operation(result) => assert_eq!(result.index, session + 3),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(replica_probe.executions(), 0);
}

#[test]
fn terminal_sessions_and_services_are_released_by_compaction() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&probe, &dir);

    let session = h.open_session(0);
    h.write(10, session, 1);
    let index = h.log.write().append(
        1,
        LogTime::new(20),
        EntryPayload::CloseSession {
            session_id: session,
        },
    );
    h.engine.apply(index).unwrap();

    // The closed session survives until compaction removes its entries.
    assert!(h.engine.session(session).is_some());
    h.compactor.maybe_compact(&mut h.engine).unwrap();
    assert!(h.engine.session(session).is_none());
    assert!(h.engine.service("test").is_none());

    // A later open recreates the service fresh.
    let session2 = h.open_session(30);
    assert!(session2 > session);
    assert!(h.engine.service("test").is_some());
}
