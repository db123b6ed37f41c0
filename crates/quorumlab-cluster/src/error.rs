//! Error types for quorumlab-cluster.

use quorumlab_store::StoreError;
use thiserror::Error;

use crate::status::MemberState;

/// Errors returned by cluster and member operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Invalid cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A member failed to come up.
    #[error("failed to start {name}: {reason}")]
    Start {
        /// Member name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// No member at the given index or endpoint.
    #[error("member not found: {0}")]
    NotFound(String),

    /// The member is already in the requested state.
    #[error("{name} is already {state}")]
    AlreadyInState {
        /// Member name.
        name: String,
        /// Its current state.
        state: MemberState,
    },

    /// A membership control call failed.
    #[error("membership change failed: {0}")]
    Membership(String),

    /// Status or hash could not be fetched from a member.
    #[error("status fetch from {name} failed: {reason}")]
    StatusFetch {
        /// Member name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// More than one member claims leadership.
    #[error("more than one leader: {}", .0.join(", "))]
    DuplicateLeader(Vec<String>),

    /// The cluster root token was canceled.
    #[error("cluster canceled")]
    Canceled,

    /// Error from the store node or client.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
