//! Cluster membership metadata.
//!
//! The consensus core owns membership; this module carries the client-visible
//! view of it: who the members are, who (if anyone) is leader, and the term.

use serde::{Deserialize, Serialize};

/// Opaque identifier of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    /// Create a member id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Replication role of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    /// Votes and replicates.
    Active,
    /// Replicates without voting.
    Passive,
    /// Standby, promoted on demand.
    Reserve,
}

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub host: String,
    pub port: u16,
    pub role: MemberRole,
}

impl Member {
    /// Create an active member.
    pub fn active(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: MemberId::new(id),
            host: host.into(),
            port,
            role: MemberRole::Active,
        }
    }
}

/// The client-visible cluster view.
///
/// Members keep their insertion order. A leader hint that does not name a
/// known member is discarded rather than stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    members: Vec<Member>,
    leader: Option<MemberId>,
    term: u64,
}

impl ClusterView {
    /// Create a view with the given members and no leader.
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members,
            leader: None,
            term: 0,
        }
    }

    /// The members in insertion order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Look up a member by id.
    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }

    /// The current leader, if known.
    pub fn leader(&self) -> Option<&Member> {
        self.leader.as_ref().and_then(|id| self.member(id))
    }

    /// The current term.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Replace the member list, dropping a leader hint that no longer
    /// resolves.
    pub fn set_members(&mut self, members: Vec<Member>) {
        self.members = members;
        if let Some(leader) = self.leader.clone() {
            if self.member(&leader).is_none() {
                self.leader = None;
            }
        }
    }

    /// Record a leader hint. Hints naming unknown members are discarded.
    pub fn set_leader(&mut self, leader: Option<MemberId>) {
        self.leader = leader.filter(|id| self.member(id).is_some());
    }

    /// Record the term.
    pub fn set_term(&mut self, term: u64) {
        self.term = term;
    }

    /// Adopt `(term, leader, members)` returned by a server, in one step.
    pub fn adopt(&mut self, term: u64, leader: Option<MemberId>, members: Vec<Member>) {
        self.term = term;
        self.set_members(members);
        self.set_leader(leader);
    }
}
