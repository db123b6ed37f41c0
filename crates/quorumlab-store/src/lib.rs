//! Embedded replicated key-value store node built on openraft.
//!
//! Each [`StoreNode`] owns:
//! - a sled database holding the raft log, vote, state machine metadata and
//!   the replicated `kv` tree
//! - an openraft instance replicating [`KvCommand`]s
//! - a peer listener (raft RPCs, forwarded leader requests) and a client
//!   listener, both nng REP sockets speaking JSON
//!
//! # Usage
//!
//! ```ignore
//! use quorumlab_store::{NodeConfig, NodeMember, StoreClient, StoreNode};
//!
//! let config = NodeConfig::new(1, "node1")
//!     .with_data_dir("/tmp/lab/node1.data")
//!     .with_client_addr("127.0.0.1:2379")
//!     .with_peer_addr("127.0.0.1:2380")
//!     .with_initial_cluster(vec![NodeMember::new(1, "node1", "127.0.0.1:2380")]);
//!
//! let node = Arc::new(StoreNode::start(config).await?);
//! node.ready().await?;
//!
//! let client = StoreClient::embedded(node.clone());
//! client.put("foo", "bar").await?;
//! assert_eq!(client.get("foo", true).await?, Some("bar".to_string()));
//! ```

pub mod client;
pub mod config;
pub mod error;
mod leader;
pub mod network;
pub mod node;
pub mod storage;
pub mod types;

pub use client::StoreClient;
pub use config::{ClusterState, NodeConfig, NodeMember, TlsInfo};
pub use error::{Result, StoreError};
pub use network::NodeStatus;
pub use node::StoreNode;
pub use types::{KvCommand, KvResponse, NodeId, TypeConfig};

pub use openraft::{BasicNode, Raft, RaftMetrics};
