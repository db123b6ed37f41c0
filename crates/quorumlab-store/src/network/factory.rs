//! Factory for creating Raft network connections.

use std::time::Duration;

use openraft::network::RaftNetworkFactory;
use openraft::BasicNode;

use crate::config::TlsInfo;
use crate::network::transport::NngRaftNetwork;
use crate::types::{NodeId, TypeConfig};

/// Creates NNG connections to peers on demand.
pub struct NngNetworkFactory {
    node_id: NodeId,
    peer_tls: TlsInfo,
    timeout: Duration,
}

impl NngNetworkFactory {
    /// Create a new network factory.
    pub fn new(node_id: NodeId, peer_tls: TlsInfo, timeout: Duration) -> Self {
        Self {
            node_id,
            peer_tls,
            timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for NngNetworkFactory {
    type Network = NngRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        tracing::debug!(
            node = self.node_id,
            peer = target,
            addr = %node.addr,
            "creating peer client"
        );
        NngRaftNetwork::new(target, node.clone(), self.peer_tls.clone()).with_timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_creates_client() {
        let mut factory = NngNetworkFactory::new(1, TlsInfo::default(), Duration::from_secs(1));
        let target_node = BasicNode {
            addr: "127.0.0.1:2382".to_string(),
        };

        let network = factory.new_client(2, &target_node).await;
        assert_eq!(network.target_id, 2);
    }
}
