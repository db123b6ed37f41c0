//! Configuration types for a store node.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Default timeout for forwarded and client requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS material for one listener (client or peer).
///
/// An empty value means the listener speaks plain TCP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    /// Path to the TLS certificate file.
    pub cert_path: Option<PathBuf>,

    /// Path to the TLS private key file.
    pub key_path: Option<PathBuf>,

    /// Path to the CA certificate for verifying the remote side.
    pub ca_path: Option<PathBuf>,
}

impl TlsInfo {
    /// Create TLS info from a certificate and key.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            ca_path: None,
        }
    }

    /// Verify the remote side with the given CA certificate.
    pub fn with_ca(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    /// True when no certificate material is configured.
    pub fn is_empty(&self) -> bool {
        self.cert_path.is_none() && self.key_path.is_none()
    }

    /// The nng URL for an address under this TLS setting.
    pub fn url(&self, addr: &str) -> String {
        if self.is_empty() {
            format!("tcp://{}", addr)
        } else {
            format!("tls+tcp://{}", addr)
        }
    }
}

/// Whether the node bootstraps a new raft group or joins an existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    /// Fresh group: the node initializes the initial membership.
    #[default]
    New,
    /// The node's membership is already recorded by the group (restart, join).
    Existing,
}

/// A node member in the initial cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMember {
    /// Node ID.
    pub id: NodeId,
    /// Human readable name.
    pub name: String,
    /// Peer address (host:port).
    pub addr: String,
}

impl NodeMember {
    /// Create a new node member.
    pub fn new(id: NodeId, name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            addr: addr.into(),
        }
    }
}

/// Configuration for a store node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human readable node name.
    pub name: String,

    /// This node's unique raft ID.
    pub node_id: NodeId,

    /// Directory for the node's database and snapshots.
    pub data_dir: PathBuf,

    /// Address the client listener binds to (host:port).
    pub client_addr: String,

    /// Address the peer listener binds to (host:port).
    pub peer_addr: String,

    /// TLS for the client listener.
    #[serde(default)]
    pub client_tls: TlsInfo,

    /// TLS for the peer listener.
    #[serde(default)]
    pub peer_tls: TlsInfo,

    /// Members of the group at bootstrap time.
    pub initial_cluster: Vec<NodeMember>,

    /// Bootstrap or join.
    #[serde(default)]
    pub cluster_state: ClusterState,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,

    /// Number of log entries between snapshots.
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,

    /// Timeout for forwarded and client requests.
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node1".to_string(),
            node_id: 1,
            client_addr: "127.0.0.1:2379".to_string(),
            peer_addr: "127.0.0.1:2380".to_string(),
            data_dir: PathBuf::from("./node1.data"),
            client_tls: TlsInfo::default(),
            peer_tls: TlsInfo::default(),
            initial_cluster: Vec::new(),
            cluster_state: ClusterState::New,
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            snapshot_threshold: 10000,
            max_entries_per_append: 100,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId, name: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the client listen address.
    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = addr.into();
        self
    }

    /// Set the peer listen address.
    pub fn with_peer_addr(mut self, addr: impl Into<String>) -> Self {
        self.peer_addr = addr.into();
        self
    }

    /// Set the client TLS material.
    pub fn with_client_tls(mut self, tls: TlsInfo) -> Self {
        self.client_tls = tls;
        self
    }

    /// Set the peer TLS material.
    pub fn with_peer_tls(mut self, tls: TlsInfo) -> Self {
        self.peer_tls = tls;
        self
    }

    /// Set the initial cluster membership.
    pub fn with_initial_cluster(mut self, members: Vec<NodeMember>) -> Self {
        self.initial_cluster = members;
        self
    }

    /// Set the cluster state.
    pub fn with_cluster_state(mut self, state: ClusterState) -> Self {
        self.cluster_state = state;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the election timeout range.
    pub fn with_election_timeout_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set the snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// nng URL of the client listener.
    pub fn client_url(&self) -> String {
        self.client_tls.url(&self.client_addr)
    }

    /// nng URL of the peer listener.
    pub fn peer_url(&self) -> String {
        self.peer_tls.url(&self.peer_addr)
    }

    /// Path of the sled database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Path of the snapshot directory.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Initial membership as openraft nodes keyed by ID.
    pub fn initial_nodes(&self) -> BTreeMap<NodeId, BasicNode> {
        self.initial_cluster
            .iter()
            .map(|m| (m.id, BasicNode { addr: m.addr.clone() }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_default() {
        let config = NodeConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert_eq!(config.cluster_state, ClusterState::New);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_node_config_builder() {
        let config = NodeConfig::new(5, "node5")
            .with_client_addr("127.0.0.1:3000")
            .with_peer_addr("127.0.0.1:3001")
            .with_heartbeat_interval_ms(50)
            .with_election_timeout_ms(200, 400)
            .with_cluster_state(ClusterState::Existing);

        assert_eq!(config.node_id, 5);
        assert_eq!(config.name, "node5");
        assert_eq!(config.client_url(), "tcp://127.0.0.1:3000");
        assert_eq!(config.peer_url(), "tcp://127.0.0.1:3001");
        assert_eq!(config.election_timeout_min_ms, 200);
        assert_eq!(config.election_timeout_max_ms, 400);
        assert_eq!(config.cluster_state, ClusterState::Existing);
    }

    #[test]
    fn test_tls_url() {
        let plain = TlsInfo::default();
        assert!(plain.is_empty());
        assert_eq!(plain.url("127.0.0.1:2380"), "tcp://127.0.0.1:2380");

        let tls = TlsInfo::new("/certs/server.pem", "/certs/server-key.pem").with_ca("/certs/ca.pem");
        assert!(!tls.is_empty());
        assert_eq!(tls.url("127.0.0.1:2380"), "tls+tcp://127.0.0.1:2380");
    }

    #[test]
    fn test_initial_nodes() {
        let config = NodeConfig::new(1, "node1").with_initial_cluster(vec![
            NodeMember::new(1, "node1", "127.0.0.1:2380"),
            NodeMember::new(2, "node2", "127.0.0.1:2382"),
            NodeMember::new(3, "node3", "127.0.0.1:2384"),
        ]);

        let nodes = config.initial_nodes();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[&2].addr, "127.0.0.1:2382");
    }

    #[test]
    fn test_data_paths() {
        let config = NodeConfig::new(1, "node1").with_data_dir("/tmp/lab/node1.data");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/lab/node1.data/db"));
        assert_eq!(
            config.snapshot_dir(),
            PathBuf::from("/tmp/lab/node1.data/snapshots")
        );
    }
}
