//! Cached member status as shown to callers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Raft role of a member, or `Stopped` when it is down or unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Not running, or not reachable on the last refresh.
    #[default]
    Stopped,
    /// Running and following a leader (or still looking for one).
    Follower,
    /// Running and leading the group.
    Leader,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Stopped => "Stopped",
            MemberState::Follower => "Follower",
            MemberState::Leader => "Leader",
        };
        f.write_str(s)
    }
}

/// Snapshot of one member's health.
///
/// Field names serialize in PascalCase so the web UI can consume them as-is.
/// A `Stopped` status always carries zero size, zero hash and no leadership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemberStatus {
    pub name: String,
    /// Raft ID in hex, empty until the member has reported one.
    #[serde(rename = "ID")]
    pub id: String,
    pub endpoint: String,

    pub is_leader: bool,
    pub state: MemberState,
    pub state_txt: String,

    #[serde(rename = "DBSize")]
    pub db_size: u64,
    #[serde(rename = "DBSizeTxt")]
    pub db_size_txt: String,
    pub hash: u32,
}

impl MemberStatus {
    /// Initial status of a member that has not started yet.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// True when the member is considered down.
    pub fn is_stopped(&self) -> bool {
        self.state == MemberState::Stopped
    }

    /// Mark the member down with an explanation, clearing size, hash and leadership.
    pub(crate) fn mark_stopped(&mut self, state_txt: String) {
        self.state = MemberState::Stopped;
        self.state_txt = state_txt;
        self.is_leader = false;
        self.db_size = 0;
        self.db_size_txt.clear();
        self.hash = 0;
    }

    /// Set role from a leader observation.
    pub(crate) fn set_leader(&mut self, is_leader: bool) {
        self.is_leader = is_leader;
        self.state = if is_leader {
            MemberState::Leader
        } else {
            MemberState::Follower
        };
    }
}

/// Format a raft ID the way member IDs are displayed.
pub(crate) fn format_id(id: u64) -> String {
    format!("{:x}", id)
}
