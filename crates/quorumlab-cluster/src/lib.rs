//! Lifecycle orchestration for local clusters of quorumlab store nodes.
//!
//! A [`Cluster`] starts a fixed set of [`Member`]s on sequential ports, waits
//! until they agree on a leader, and then lets callers stop, restart, add
//! and remove members while a background loop keeps every member's
//! [`MemberStatus`] fresh. Disruptive calls are usually gated by a
//! [`RequestLimiter`] in the calling layer.
//!
//! # Usage
//!
//! ```ignore
//! use quorumlab_cluster::{Cluster, ClusterConfig};
//!
//! let cluster = Cluster::start(ClusterConfig::new(3, "/tmp/lab").with_root_port(2379)).await?;
//! cluster.client(0)?.put("foo", "bar").await?;
//!
//! cluster.stop(0).await?;
//! cluster.restart(0).await?;
//! cluster.refresh_status().await;
//! println!("{:?}", cluster.all_member_status());
//!
//! cluster.shutdown().await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod humanize;
pub mod member;
pub mod ratelimit;
pub mod status;
pub mod util;

pub use cluster::{quorum, Cluster};
pub use config::{ClusterConfig, MAX_SIZE};
pub use error::{ClusterError, Result};
pub use member::Member;
pub use ratelimit::{LimitDecision, RequestLimiter};
pub use status::{MemberState, MemberStatus};
