//! Client-side session view.
//!
//! Tracks what the client believes about its session: the id, the request id
//! counter, the version (highest request id whose command completed), and
//! the event index (highest log index whose events were observed). Version
//! never moves on query success; a read must not mask a missed event.

/// Lifecycle of the client's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    /// No session yet, or re-registration in progress.
    Connecting,
    Open,
    Expired,
    Closed,
}

/// The client's view of its session.
#[derive(Debug)]
pub struct SessionView {
    id: u64,
    version: u64,
    event_index: u64,
    next_request_id: u64,
    state: ClientSessionState,
}

impl SessionView {
    /// A view with no session.
    pub fn new() -> Self {
        Self {
            id: 0,
            version: 0,
            event_index: 0,
            next_request_id: 1,
            state: ClientSessionState::Connecting,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Highest request id whose command result the client has received.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Highest event index the client has observed.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    pub fn state(&self) -> ClientSessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ClientSessionState::Open
    }

    /// Adopt a freshly registered session. Counters restart with it: the
    /// server sequences the new session from one.
    pub fn open(&mut self, id: u64) {
        self.id = id;
        self.version = 0;
        self.event_index = 0;
        self.next_request_id = 1;
        self.state = ClientSessionState::Open;
    }

    /// Allocate the next command request id. Strictly increasing per
    /// session; retransmits reuse the id they were allocated.
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Record a completed command. Version never decreases.
    pub fn observe_version(&mut self, request_id: u64) {
        self.version = self.version.max(request_id);
    }

    /// Record observed events up to `index`.
    pub fn observe_event(&mut self, index: u64) {
        self.event_index = self.event_index.max(index);
    }

    /// The session was lost; a new registration will reopen it.
    pub fn expire(&mut self) {
        if self.state == ClientSessionState::Open || self.state == ClientSessionState::Connecting {
            self.state = ClientSessionState::Expired;
        }
    }

    /// The client closed the session. Terminal.
    pub fn close(&mut self) {
        self.state = ClientSessionState::Closed;
    }
}

impl Default for SessionView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_strictly_increasing() {
        let mut view = SessionView::new();
        view.open(10);
        assert_eq!(view.next_request_id(), 1);
        assert_eq!(view.next_request_id(), 2);
        assert_eq!(view.next_request_id(), 3);
    }

    #[test]
    fn version_is_monotone() {
        let mut view = SessionView::new();
        view.open(10);
        view.observe_version(3);
        view.observe_version(1);
        assert_eq!(view.version(), 3);
    }

    #[test]
    fn reopen_restarts_counters() {
        let mut view = SessionView::new();
        view.open(10);
        view.next_request_id();
        view.observe_version(1);
        view.observe_event(11);
        view.expire();
        assert_eq!(view.state(), ClientSessionState::Expired);

        view.open(42);
        assert!(view.is_open());
        assert_eq!(view.id(), 42);
        assert_eq!(view.version(), 0);
        assert_eq!(view.event_index(), 0);
        assert_eq!(view.next_request_id(), 1);
    }

    #[test]
    fn close_is_terminal() {
        let mut view = SessionView::new();
        view.open(10);
        view.close();
        view.expire();
        assert_eq!(view.state(), ClientSessionState::Closed);
    }
}
