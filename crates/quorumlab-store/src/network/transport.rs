//! NNG-based Raft network transport.

use std::future::Future;
use std::time::Duration;

use anyerror::AnyError;
use nng::options::{Options, RecvTimeout, SendTimeout};
use nng::{Protocol, Socket};
use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, ReplicationClosed,
    StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{BasicNode, Vote};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::TlsInfo;
use crate::error::StoreError;
use crate::network::messages::RaftMessage;
use crate::network::configure_tls;
use crate::types::{NodeId, TypeConfig};

/// Snapshot chunk size for `full_snapshot`.
const SNAPSHOT_CHUNK_SIZE: usize = 1024 * 1024;

/// Open a REQ socket to `url` with send/recv timeouts.
pub(crate) fn dial(url: &str, tls: &TlsInfo, timeout: Duration) -> Result<Socket, StoreError> {
    let socket = Socket::new(Protocol::Req0)?;
    socket.set_opt::<SendTimeout>(Some(timeout))?;
    socket.set_opt::<RecvTimeout>(Some(timeout))?;
    configure_tls(&socket, tls)?;
    socket
        .dial(url)
        .map_err(|e| StoreError::Network(format!("failed to connect to {}: {}", url, e)))?;
    Ok(socket)
}

/// Send one JSON request on `socket` and decode the JSON reply.
pub(crate) fn exchange<Req, Rep>(socket: &Socket, request: &Req) -> Result<Rep, StoreError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let payload = serde_json::to_vec(request)?;
    socket
        .send(nng::Message::from(payload.as_slice()))
        .map_err(|(_, e)| StoreError::from(e))?;
    let reply = socket.recv()?;
    Ok(serde_json::from_slice(reply.as_slice())?)
}

/// Dial, exchange one request, and close.
pub(crate) fn round_trip<Req, Rep>(
    url: &str,
    tls: &TlsInfo,
    timeout: Duration,
    request: &Req,
) -> Result<Rep, StoreError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let socket = dial(url, tls, timeout)?;
    exchange(&socket, request)
}

/// NNG-based Raft network transport to one peer.
///
/// This implements openraft's `RaftNetwork` trait. Each RPC dials a fresh
/// REQ socket on a blocking thread.
pub struct NngRaftNetwork {
    target: BasicNode,
    /// Target node ID.
    pub target_id: NodeId,
    tls: TlsInfo,
    timeout: Duration,
}

impl NngRaftNetwork {
    /// Create a new NNG network connection to the target node.
    pub fn new(target_id: NodeId, target: BasicNode, tls: TlsInfo) -> Self {
        Self {
            target,
            target_id,
            tls,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn peer_url(&self) -> String {
        self.tls.url(&self.target.addr)
    }

    async fn send_message(&self, msg: RaftMessage) -> Result<RaftMessage, StoreError> {
        let url = self.peer_url();
        let tls = self.tls.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || round_trip(&url, &tls, timeout, &msg))
            .await
            .map_err(|e| StoreError::Internal(format!("task join failed: {}", e)))?
    }
}

fn unexpected(reply: RaftMessage) -> NetworkError {
    match reply {
        RaftMessage::Error(msg) => NetworkError::new(&AnyError::error(msg)),
        other => NetworkError::new(&AnyError::error(format!(
            "unexpected reply: {:?}",
            other
        ))),
    }
}

impl RaftNetwork<TypeConfig> for NngRaftNetwork {
    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.send_message(RaftMessage::Vote(rpc)).await {
            Ok(RaftMessage::VoteReply(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(unexpected(other))),
            Err(e) => {
                tracing::debug!(peer = self.target_id, error = %e, "vote RPC failed");
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        match self.send_message(RaftMessage::AppendEntries(rpc)).await {
            Ok(RaftMessage::AppendEntriesReply(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(unexpected(other))),
            Err(e) => {
                tracing::debug!(peer = self.target_id, error = %e, "append_entries RPC failed");
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        match self.send_message(RaftMessage::InstallSnapshot(rpc)).await {
            Ok(RaftMessage::InstallSnapshotReply(resp)) => Ok(resp),
            Ok(other) => Err(RPCError::Network(unexpected(other))),
            Err(e) => {
                tracing::debug!(peer = self.target_id, error = %e, "install_snapshot RPC failed");
                Err(RPCError::Unreachable(Unreachable::new(&e)))
            }
        }
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<NodeId>,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let meta = snapshot.meta;
        let data = snapshot.snapshot.into_inner();
        let mut remote_vote = vote;

        // An empty snapshot still needs one `done` chunk.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&data[..]]
        } else {
            data.chunks(SNAPSHOT_CHUNK_SIZE).collect()
        };
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let rpc = InstallSnapshotRequest {
                vote,
                meta: meta.clone(),
                offset: (i * SNAPSHOT_CHUNK_SIZE) as u64,
                data: chunk.to_vec(),
                done: i == last,
            };

            match self.send_message(RaftMessage::InstallSnapshot(rpc)).await {
                Ok(RaftMessage::InstallSnapshotReply(resp)) => {
                    remote_vote = resp.vote;
                    if resp.vote > vote {
                        break;
                    }
                }
                Ok(other) => return Err(StreamingError::Network(unexpected(other))),
                Err(e) => {
                    tracing::warn!(peer = self.target_id, error = %e, "snapshot transfer failed");
                    return Err(StreamingError::Unreachable(Unreachable::new(&e)));
                }
            }
        }

        Ok(SnapshotResponse { vote: remote_vote })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addr: &str) -> BasicNode {
        BasicNode {
            addr: addr.to_string(),
        }
    }

    #[test]
    fn test_peer_url() {
        let network = NngRaftNetwork::new(1, node("127.0.0.1:2380"), TlsInfo::default());
        assert_eq!(network.peer_url(), "tcp://127.0.0.1:2380");

        let network = NngRaftNetwork::new(
            1,
            node("127.0.0.1:2380"),
            TlsInfo::new("/certs/peer.pem", "/certs/peer-key.pem"),
        );
        assert_eq!(network.peer_url(), "tls+tcp://127.0.0.1:2380");
    }

    #[test]
    fn test_timeout_configuration() {
        let network = NngRaftNetwork::new(1, node("127.0.0.1:2380"), TlsInfo::default())
            .with_timeout(Duration::from_secs(10));
        assert_eq!(network.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let mut network = NngRaftNetwork::new(2, node("127.0.0.1:1"), TlsInfo::default())
            .with_timeout(Duration::from_millis(200));

        let result = network
            .vote(
                VoteRequest::new(Vote::new(1, 1), None),
                RPCOption::new(Duration::from_millis(200)),
            )
            .await;

        assert!(matches!(result, Err(RPCError::Unreachable(_))));
    }
}
