//! Session table.
//!
//! Owned exclusively by the apply engine. Session ids are log indexes, so a
//! `BTreeMap` keyed by id yields insertion-ordered iteration for free.

use crate::session::state::{SessionState, SessionStatus};
use std::collections::BTreeMap;

/// All sessions known to the apply engine, id-ordered.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<u64, SessionState>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked sessions, terminal ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register a freshly opened session.
    pub fn register(&mut self, session: SessionState) {
        self.sessions.insert(session.id(), session);
    }

    /// Look up a session by id.
    pub fn get(&self, id: u64) -> Option<&SessionState> {
        self.sessions.get(&id)
    }

    /// Look up a session mutably.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut SessionState> {
        self.sessions.get_mut(&id)
    }

    /// Look up an Open session by id.
    pub fn get_open(&self, id: u64) -> Option<&SessionState> {
        self.sessions.get(&id).filter(|s| s.is_open())
    }

    /// Look up an Open session mutably.
    pub fn get_open_mut(&mut self, id: u64) -> Option<&mut SessionState> {
        self.sessions.get_mut(&id).filter(|s| s.is_open())
    }

    /// All sessions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }

    /// All sessions, mutable, in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionState> {
        self.sessions.values_mut()
    }

    /// Sessions bound to the named service, in id order.
    pub fn for_service<'a>(
        &'a self,
        service_name: &'a str,
    ) -> impl Iterator<Item = &'a SessionState> {
        self.sessions
            .values()
            .filter(move |s| s.service_name() == service_name)
    }

    /// Open sessions bound to the named service, mutable.
    pub fn open_for_service_mut<'a>(
        &'a mut self,
        service_name: &'a str,
    ) -> impl Iterator<Item = &'a mut SessionState> {
        self.sessions
            .values_mut()
            .filter(move |s| s.is_open() && s.service_name() == service_name)
    }

    /// Remove terminal sessions whose id is at or below `index`.
    ///
    /// Removal is deferred to compaction so duplicate keep-alives for a dead
    /// session keep failing with a clean unknown-session answer until the log
    /// no longer references it.
    pub fn purge_terminal(&mut self, index: u64) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|&id, s| s.status() == SessionStatus::Open || id > index);
        before - self.sessions.len()
    }
}
