//! Server error types.

use quorumlab_cluster::ClusterError;
use quorumlab_store::StoreError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster orchestration error.
    #[error("{0}")]
    Cluster(#[from] ClusterError),

    /// Store client error.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A rate limiter refused the request.
    #[error("{0}")]
    RateLimited(String),

    /// The request would leave the cluster without quorum.
    #[error("refused: {0}")]
    Quorum(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;
