//! REP socket server loops for peer and client traffic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nng::options::{Options, RecvTimeout};
use nng::{Protocol, Socket};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TlsInfo;
use crate::error::StoreError;
use crate::leader::execute_on_leader;
use crate::network::configure_tls;
use crate::network::messages::RaftMessage;
use crate::types::{NodeId, StoreRaft};

/// How long a receive blocks before the loop re-checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Dispatches decoded requests received on a [`RepServer`].
pub(crate) trait MessageHandler: Send + 'static {
    type Request: DeserializeOwned;
    type Reply: Serialize;

    /// Handle one request.
    fn handle(&self, request: Self::Request) -> impl Future<Output = Self::Reply>;

    /// Reply sent when a request cannot be decoded.
    fn malformed(&self, error: String) -> Self::Reply;
}

/// A bound REP socket.
///
/// Binding happens in [`RepServer::bind`] so address conflicts surface to the
/// caller; the receive loop then runs on a blocking thread.
pub struct RepServer {
    name: &'static str,
    node_id: NodeId,
    url: String,
    socket: Socket,
}

impl RepServer {
    /// Create a REP socket and listen on `addr`.
    pub fn bind(
        name: &'static str,
        node_id: NodeId,
        addr: &str,
        tls: &TlsInfo,
    ) -> Result<Self, StoreError> {
        let socket = Socket::new(Protocol::Rep0)?;
        socket.set_opt::<RecvTimeout>(Some(POLL_INTERVAL))?;
        configure_tls(&socket, tls)?;

        let url = tls.url(addr);
        socket
            .listen(&url)
            .map_err(|e| StoreError::Network(format!("failed to listen on {}: {}", url, e)))?;

        tracing::info!(node = node_id, listener = name, url = %url, "listener started");

        Ok(Self {
            name,
            node_id,
            url,
            socket,
        })
    }

    /// The URL this server listens on.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run the receive loop on a blocking thread until `shutdown` fires.
    ///
    /// A loop that dies with an error publishes it on `errors`.
    pub(crate) fn spawn<H: MessageHandler>(
        self,
        handler: H,
        shutdown: CancellationToken,
        errors: Arc<watch::Sender<Option<String>>>,
    ) -> JoinHandle<Result<(), StoreError>> {
        tokio::task::spawn_blocking(move || {
            let name = self.name;
            let result = self.run_sync(handler, shutdown);
            if let Err(e) = &result {
                tracing::error!(listener = name, error = %e, "listener failed");
                errors.send_replace(Some(format!("{} listener: {}", name, e)));
            }
            result
        })
    }

    fn run_sync<H: MessageHandler>(
        self,
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<(), StoreError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Internal(format!("failed to create runtime: {}", e)))?;

        while !shutdown.is_cancelled() {
            let request = match self.socket.recv() {
                Ok(msg) => msg,
                Err(nng::Error::TimedOut) => continue,
                Err(nng::Error::Closed) => break,
                Err(e) => return Err(e.into()),
            };

            let reply = match serde_json::from_slice::<H::Request>(request.as_slice()) {
                Ok(req) => rt.block_on(handler.handle(req)),
                Err(e) => {
                    tracing::warn!(listener = self.name, error = %e, "malformed request");
                    handler.malformed(e.to_string())
                }
            };

            let bytes = serde_json::to_vec(&reply)?;
            if let Err((_, e)) = self.socket.send(nng::Message::from(bytes.as_slice())) {
                tracing::warn!(listener = self.name, error = %e, "failed to send reply");
            }
        }

        tracing::info!(node = self.node_id, listener = self.name, "listener stopped");
        Ok(())
    }
}

/// Serves raft RPCs and forwarded leader requests from peers.
pub(crate) struct PeerHandler {
    raft: StoreRaft,
}

impl PeerHandler {
    pub(crate) fn new(raft: StoreRaft) -> Self {
        Self { raft }
    }
}

impl MessageHandler for PeerHandler {
    type Request = RaftMessage;
    type Reply = RaftMessage;

    async fn handle(&self, request: RaftMessage) -> RaftMessage {
        match request {
            RaftMessage::Vote(req) => match self.raft.vote(req).await {
                Ok(resp) => RaftMessage::VoteReply(resp),
                Err(e) => RaftMessage::Error(e.to_string()),
            },
            RaftMessage::AppendEntries(req) => match self.raft.append_entries(req).await {
                Ok(resp) => RaftMessage::AppendEntriesReply(resp),
                Err(e) => RaftMessage::Error(e.to_string()),
            },
            RaftMessage::InstallSnapshot(req) => match self.raft.install_snapshot(req).await {
                Ok(resp) => RaftMessage::InstallSnapshotReply(resp),
                Err(e) => RaftMessage::Error(e.to_string()),
            },
            RaftMessage::Forward(req) => {
                RaftMessage::Forwarded(execute_on_leader(&self.raft, req).await)
            }
            other => {
                tracing::warn!(message = ?other, "unexpected peer message");
                RaftMessage::Error("unexpected message".to_string())
            }
        }
    }

    fn malformed(&self, error: String) -> RaftMessage {
        RaftMessage::Error(error)
    }
}
