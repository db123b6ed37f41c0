//! Core type definitions for openraft integration.

use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Node identifier type.
pub type NodeId = u64;

/// Type alias for the openraft Raft instance with our configuration.
pub type StoreRaft = openraft::Raft<TypeConfig>;

/// Type alias for log entry.
pub type LogEntry = openraft::Entry<TypeConfig>;

/// Type alias for log ID.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for vote.
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for membership.
pub type Membership = openraft::Membership<NodeId, BasicNode>;

/// Type alias for stored membership.
pub type StoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

openraft::declare_raft_types!(
    /// Raft type configuration for the key-value store.
    pub TypeConfig:
        D = KvCommand,
        R = KvResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

/// A command replicated through the raft log and applied on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Set `key` to `value`.
    Put { key: String, value: String },

    /// Remove `key`.
    Delete { key: String },

    /// No-op, committed to confirm leadership.
    Noop,
}

impl KvCommand {
    /// Create a put command.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a delete command.
    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }
}

/// Result of applying a [`KvCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    /// The key was written; carries the previous value if any.
    Put { previous: Option<String> },

    /// The key was removed; `existed` is false if it was absent.
    Deleted { existed: bool },

    /// Membership entry or no-op.
    Noop,

    /// Error during application.
    Error(String),
}

impl KvResponse {
    /// Check if this is an error response.
    pub fn is_error(&self) -> bool {
        matches!(self, KvResponse::Error(_))
    }

    /// Get the error message if this is an error response.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            KvResponse::Error(msg) => Some(msg),
            _ => None,
        }
    }
}
