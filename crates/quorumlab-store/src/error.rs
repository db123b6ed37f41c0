//! Error types for quorumlab-store.

use thiserror::Error;

use crate::types::NodeId;

/// Errors that can occur in a store node or client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error while bringing the node up.
    #[error("node initialization failed: {0}")]
    Initialization(String),

    /// Error during storage operations.
    #[error("storage error: {0}")]
    Storage(String),

    /// Error during network operations.
    #[error("network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error during write operations.
    #[error("write error: {0}")]
    Write(String),

    /// Error while confirming leadership for a linearizable read.
    #[error("read error: {0}")]
    Read(String),

    /// Error during membership changes.
    #[error("membership change error: {0}")]
    MembershipChange(String),

    /// No leader is known to this node.
    #[error("no leader available")]
    NoLeader,

    /// This node is not the leader.
    #[error("not the leader, current leader is node {leader_id:?} at {leader_addr:?}")]
    NotLeader {
        /// The ID of the current leader.
        leader_id: Option<NodeId>,
        /// The peer address of the current leader.
        leader_addr: Option<String>,
    },

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The node has been stopped and its handle is no longer usable.
    #[error("node {0} is stopped")]
    Stopped(String),

    /// Timeout waiting for an operation.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The request was canceled before completion.
    #[error("operation canceled")]
    Canceled,

    /// Error reported by the remote side of an RPC.
    #[error("remote error: {0}")]
    Remote(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<nng::Error> for StoreError {
    fn from(err: nng::Error) -> Self {
        match err {
            nng::Error::TimedOut => StoreError::Timeout("nng request".to_string()),
            other => StoreError::Network(other.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
