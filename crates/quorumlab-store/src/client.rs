//! Client access to a store node.

use std::sync::Arc;
use std::time::Duration;

use nng::Socket;
use parking_lot::Mutex;

use crate::config::TlsInfo;
use crate::error::{Result, StoreError};
use crate::network::messages::{ClientReply, ClientRequest, NodeStatus};
use crate::network::transport::{dial, exchange};
use crate::node::StoreNode;
use crate::types::{KvResponse, NodeId};

/// A client bound to one node.
///
/// `Embedded` calls the node directly; `Remote` talks to its client listener.
/// Both forward leader-only requests to the current leader.
#[derive(Clone)]
pub enum StoreClient {
    /// In-process handle.
    Embedded(Arc<StoreNode>),
    /// Connected REQ socket.
    Remote(RemoteClient),
}

/// REQ socket connected to a node's client listener.
#[derive(Clone)]
pub struct RemoteClient {
    url: String,
    socket: Arc<Mutex<Socket>>,
}

impl RemoteClient {
    async fn call(&self, request: ClientRequest) -> Result<ClientReply> {
        let socket = self.socket.clone();
        let reply = tokio::task::spawn_blocking(move || {
            let socket = socket.lock();
            exchange::<ClientRequest, ClientReply>(&socket, &request)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("task join failed: {}", e)))??;

        match reply {
            ClientReply::Error(msg) => Err(StoreError::Remote(msg)),
            reply => Ok(reply),
        }
    }

    /// URL of the node this client talks to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn unexpected(reply: ClientReply) -> StoreError {
    StoreError::Remote(format!("unexpected reply: {:?}", reply))
}

impl StoreClient {
    /// Client that calls `node` in-process.
    pub fn embedded(node: Arc<StoreNode>) -> Self {
        StoreClient::Embedded(node)
    }

    /// Connect to the client listener at `addr` (host:port).
    ///
    /// `timeout` bounds each request.
    pub fn connect(addr: &str, tls: &TlsInfo, timeout: Duration) -> Result<Self> {
        let url = tls.url(addr);
        let socket = dial(&url, tls, timeout)?;
        Ok(StoreClient::Remote(RemoteClient {
            url,
            socket: Arc::new(Mutex::new(socket)),
        }))
    }

    /// Replicate `key = value`.
    pub async fn put(&self, key: &str, value: &str) -> Result<KvResponse> {
        match self {
            StoreClient::Embedded(node) => node.put(key, value).await,
            StoreClient::Remote(remote) => match remote
                .call(ClientRequest::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                })
                .await?
            {
                ClientReply::Written(resp) => Ok(resp),
                other => Err(unexpected(other)),
            },
        }
    }

    /// Replicate the removal of `key`.
    pub async fn delete(&self, key: &str) -> Result<KvResponse> {
        match self {
            StoreClient::Embedded(node) => node.delete(key).await,
            StoreClient::Remote(remote) => match remote
                .call(ClientRequest::Delete {
                    key: key.to_string(),
                })
                .await?
            {
                ClientReply::Written(resp) => Ok(resp),
                other => Err(unexpected(other)),
            },
        }
    }

    /// Read `key`. A linearizable read only succeeds while a leader exists.
    pub async fn get(&self, key: &str, linearizable: bool) -> Result<Option<String>> {
        match self {
            StoreClient::Embedded(node) => node.get(key, linearizable).await,
            StoreClient::Remote(remote) => match remote
                .call(ClientRequest::Get {
                    key: key.to_string(),
                    linearizable,
                })
                .await?
            {
                ClientReply::Value(value) => Ok(value),
                other => Err(unexpected(other)),
            },
        }
    }

    /// Status of the node this client is bound to.
    pub async fn status(&self) -> Result<NodeStatus> {
        match self {
            StoreClient::Embedded(node) => node.status(),
            StoreClient::Remote(remote) => match remote.call(ClientRequest::Status).await? {
                ClientReply::Status(status) => Ok(status),
                other => Err(unexpected(other)),
            },
        }
    }

    /// Checksum of the node's key-value data.
    pub async fn hash(&self) -> Result<u32> {
        match self {
            StoreClient::Embedded(node) => node.hash(),
            StoreClient::Remote(remote) => match remote.call(ClientRequest::Hash).await? {
                ClientReply::Hash(hash) => Ok(hash),
                other => Err(unexpected(other)),
            },
        }
    }

    /// Add node `id` at peer address `addr` as a learner.
    pub async fn member_add(&self, id: NodeId, addr: &str) -> Result<()> {
        match self {
            StoreClient::Embedded(node) => node.member_add(id, addr).await,
            StoreClient::Remote(remote) => remote
                .call(ClientRequest::MemberAdd {
                    id,
                    addr: addr.to_string(),
                })
                .await
                .map(|_| ()),
        }
    }

    /// Promote learner `id` to voter.
    pub async fn member_promote(&self, id: NodeId) -> Result<()> {
        match self {
            StoreClient::Embedded(node) => node.member_promote(id).await,
            StoreClient::Remote(remote) => remote
                .call(ClientRequest::MemberPromote { id })
                .await
                .map(|_| ()),
        }
    }

    /// Remove node `id` from the group.
    pub async fn member_remove(&self, id: NodeId) -> Result<()> {
        match self {
            StoreClient::Embedded(node) => node.member_remove(id).await,
            StoreClient::Remote(remote) => remote
                .call(ClientRequest::MemberRemove { id })
                .await
                .map(|_| ()),
        }
    }
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreClient::Embedded(node) => f.debug_tuple("Embedded").field(node).finish(),
            StoreClient::Remote(remote) => f.debug_tuple("Remote").field(&remote.url).finish(),
        }
    }
}
