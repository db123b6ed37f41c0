//! A running store node: raft, storage, and both listeners.

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InitializeError, RaftError};
use openraft::Raft;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterState, NodeConfig};
use crate::error::{Result, StoreError};
use crate::leader::submit;
use crate::network::messages::{ClientReply, ClientRequest, LeaderReply, LeaderRequest, NodeStatus};
use crate::network::server::{MessageHandler, PeerHandler, RepServer};
use crate::network::NngNetworkFactory;
use crate::storage::{KvStateMachine, KvTree, SledRaftLogStorage};
use crate::types::{KvCommand, KvResponse, NodeId, StoreRaft};

/// Attempts to open the database while a previous incarnation still holds its lock.
const DB_OPEN_ATTEMPTS: u32 = 50;
const DB_OPEN_BACKOFF: Duration = Duration::from_millis(100);

/// The parts of a node that exist only while it runs.
#[derive(Clone)]
pub(crate) struct NodeCore {
    config: Arc<NodeConfig>,
    raft: StoreRaft,
    db: sled::Db,
    kv: KvTree,
}

impl NodeCore {
    async fn submit(&self, request: LeaderRequest) -> Result<LeaderReply> {
        submit(
            &self.raft,
            &self.config.peer_tls,
            self.config.request_timeout,
            request,
        )
        .await
    }

    async fn write(&self, command: KvCommand) -> Result<KvResponse> {
        match self.submit(LeaderRequest::Write(command)).await? {
            LeaderReply::Written(resp) => match resp {
                KvResponse::Error(msg) => Err(StoreError::Write(msg)),
                resp => Ok(resp),
            },
            other => Err(StoreError::Remote(format!("unexpected reply: {:?}", other))),
        }
    }

    async fn membership(&self, request: LeaderRequest) -> Result<()> {
        match self.submit(request).await? {
            LeaderReply::MembershipChanged => Ok(()),
            other => Err(StoreError::Remote(format!("unexpected reply: {:?}", other))),
        }
    }

    pub(crate) async fn put(&self, key: &str, value: &str) -> Result<KvResponse> {
        self.write(KvCommand::put(key, value)).await
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<KvResponse> {
        self.write(KvCommand::delete(key)).await
    }

    /// Read a key. A linearizable read first confirms leadership and waits
    /// until this node has applied everything committed before the read.
    pub(crate) async fn get(&self, key: &str, linearizable: bool) -> Result<Option<String>> {
        if linearizable {
            let read_index = match self.submit(LeaderRequest::ReadIndex).await? {
                LeaderReply::ReadIndex(index) => index,
                other => {
                    return Err(StoreError::Remote(format!("unexpected reply: {:?}", other)))
                }
            };

            if read_index.is_some() {
                self.raft
                    .wait(Some(self.config.request_timeout))
                    .applied_index_at_least(read_index, "linearizable read")
                    .await
                    .map_err(|e| StoreError::Read(e.to_string()))?;
            }
        }
        self.kv.get(key)
    }

    pub(crate) fn status(&self) -> Result<NodeStatus> {
        let metrics = self.raft.metrics().borrow().clone();
        Ok(NodeStatus {
            id: metrics.id,
            leader: metrics.current_leader.unwrap_or(0),
            db_size: self.db.size_on_disk()?,
            term: metrics.current_term,
            applied_index: metrics.last_applied.map(|l| l.index).unwrap_or(0),
        })
    }

    pub(crate) fn hash(&self) -> Result<u32> {
        self.kv.hash()
    }

    pub(crate) async fn member_add(&self, id: NodeId, addr: &str) -> Result<()> {
        self.membership(LeaderRequest::AddLearner {
            id,
            addr: addr.to_string(),
        })
        .await
    }

    pub(crate) async fn member_promote(&self, id: NodeId) -> Result<()> {
        self.membership(LeaderRequest::Promote { id }).await
    }

    pub(crate) async fn member_remove(&self, id: NodeId) -> Result<()> {
        self.membership(LeaderRequest::Remove { id }).await
    }

    async fn handle_client(&self, request: ClientRequest) -> Result<ClientReply> {
        Ok(match request {
            ClientRequest::Put { key, value } => ClientReply::Written(self.put(&key, &value).await?),
            ClientRequest::Delete { key } => ClientReply::Written(self.delete(&key).await?),
            ClientRequest::Get { key, linearizable } => {
                ClientReply::Value(self.get(&key, linearizable).await?)
            }
            ClientRequest::Status => ClientReply::Status(self.status()?),
            ClientRequest::Hash => ClientReply::Hash(self.hash()?),
            ClientRequest::MemberAdd { id, addr } => {
                self.member_add(id, &addr).await?;
                ClientReply::Done
            }
            ClientRequest::MemberPromote { id } => {
                self.member_promote(id).await?;
                ClientReply::Done
            }
            ClientRequest::MemberRemove { id } => {
                self.member_remove(id).await?;
                ClientReply::Done
            }
        })
    }
}

/// Serves [`ClientRequest`]s for remote clients.
struct ClientHandler {
    core: NodeCore,
}

impl MessageHandler for ClientHandler {
    type Request = ClientRequest;
    type Reply = ClientReply;

    async fn handle(&self, request: ClientRequest) -> ClientReply {
        match self.core.handle_client(request).await {
            Ok(reply) => reply,
            Err(e) => ClientReply::Error(e.to_string()),
        }
    }

    fn malformed(&self, error: String) -> ClientReply {
        ClientReply::Error(error)
    }
}

/// A store node.
///
/// Created running by [`StoreNode::start`]; [`StoreNode::hard_stop`] tears it
/// down and releases its database so a new incarnation can open the same
/// data directory.
pub struct StoreNode {
    config: Arc<NodeConfig>,
    core: RwLock<Option<NodeCore>>,
    listeners: Mutex<Vec<JoinHandle<Result<()>>>>,
    shutdown: CancellationToken,
    errors: Arc<watch::Sender<Option<String>>>,
}

impl std::fmt::Debug for StoreNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreNode")
            .field("name", &self.config.name)
            .field("node_id", &self.config.node_id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl StoreNode {
    /// Open storage, start raft and both listeners.
    ///
    /// With [`ClusterState::New`] the node also initializes the raft group
    /// with the initial cluster; a group that is already initialized is
    /// left as it is.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            StoreError::Initialization(format!("failed to create data dir: {}", e))
        })?;

        let db = open_db(&config).await?;
        let log_storage = SledRaftLogStorage::open(&db)?;
        let state_machine = KvStateMachine::new(&db, config.snapshot_dir())?;
        let kv = state_machine.kv().clone();

        let raft_config = Arc::new(
            openraft::Config {
                cluster_name: "quorumlab".to_string(),
                heartbeat_interval: config.heartbeat_interval_ms,
                election_timeout_min: config.election_timeout_min_ms,
                election_timeout_max: config.election_timeout_max_ms,
                max_payload_entries: config.max_entries_per_append,
                snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                    config.snapshot_threshold,
                ),
                ..Default::default()
            }
            .validate()
            .map_err(|e| StoreError::Initialization(e.to_string()))?,
        );

        let network = NngNetworkFactory::new(
            config.node_id,
            config.peer_tls.clone(),
            config.request_timeout,
        );

        let raft = Raft::new(config.node_id, raft_config, network, log_storage, state_machine)
            .await
            .map_err(|e| StoreError::Initialization(e.to_string()))?;

        let core = NodeCore {
            config: config.clone(),
            raft: raft.clone(),
            db,
            kv,
        };

        let shutdown = CancellationToken::new();
        let (errors, _) = watch::channel(None);
        let errors = Arc::new(errors);

        let bound = RepServer::bind("peer", config.node_id, &config.peer_addr, &config.peer_tls)
            .and_then(|peer| {
                let client = RepServer::bind(
                    "client",
                    config.node_id,
                    &config.client_addr,
                    &config.client_tls,
                )?;
                Ok((peer, client))
            });
        let (peer, client) = match bound {
            Ok(servers) => servers,
            Err(e) => {
                let _ = raft.shutdown().await;
                return Err(e);
            }
        };

        let listeners = vec![
            peer.spawn(PeerHandler::new(raft.clone()), shutdown.clone(), errors.clone()),
            client.spawn(
                ClientHandler { core: core.clone() },
                shutdown.clone(),
                errors.clone(),
            ),
        ];

        let node = Self {
            config: config.clone(),
            core: RwLock::new(Some(core)),
            listeners: Mutex::new(listeners),
            shutdown,
            errors,
        };

        if config.cluster_state == ClusterState::New {
            if let Err(e) = node.initialize(&raft).await {
                node.hard_stop().await;
                return Err(e);
            }
        }

        tracing::info!(
            node = config.node_id,
            name = %config.name,
            client = %config.client_url(),
            peer = %config.peer_url(),
            state = ?config.cluster_state,
            "store node started"
        );

        Ok(node)
    }

    async fn initialize(&self, raft: &StoreRaft) -> Result<()> {
        match raft.initialize(self.config.initial_nodes()).await {
            Ok(()) => Ok(()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::debug!(node = self.config.node_id, "raft group already initialized");
                Ok(())
            }
            Err(e) => Err(StoreError::Initialization(e.to_string())),
        }
    }

    /// The configuration this node was started with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// This node's raft ID.
    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub(crate) fn core(&self) -> Result<NodeCore> {
        self.core
            .read()
            .clone()
            .ok_or_else(|| StoreError::Stopped(self.config.name.clone()))
    }

    /// Resolves once the node observes a leader.
    pub async fn ready(&self) -> Result<()> {
        let mut metrics = self.core()?.raft.metrics();
        loop {
            if metrics.borrow().current_leader.is_some() {
                return Ok(());
            }
            tokio::select! {
                changed = metrics.changed() => {
                    if changed.is_err() {
                        return Err(StoreError::Stopped(self.config.name.clone()));
                    }
                }
                _ = self.shutdown.cancelled() => {
                    return Err(StoreError::Stopped(self.config.name.clone()));
                }
            }
        }
    }

    /// Resolves with the first fatal error reported by a listener.
    pub async fn error(&self) -> String {
        let mut rx = self.errors.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`, so this never fires.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves once the node has been stopped.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// True after [`StoreNode::hard_stop`].
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop immediately, without transferring leadership.
    ///
    /// Waits for both listener threads to exit so their ports are free, and
    /// drops the database handle. Calling it twice is harmless.
    pub async fn hard_stop(&self) {
        self.shutdown.cancel();

        let core = self.core.write().take();
        if let Some(core) = &core {
            if let Err(e) = core.raft.shutdown().await {
                tracing::warn!(node = self.config.node_id, error = %e, "raft shutdown failed");
            }
        }

        let listeners: Vec<_> = std::mem::take(&mut *self.listeners.lock());
        for handle in listeners {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "listener exited with error"),
                Err(e) => tracing::warn!(error = %e, "listener task panicked"),
            }
        }

        if let Some(core) = core {
            if let Err(e) = core.db.flush_async().await {
                tracing::warn!(node = self.config.node_id, error = %e, "flush on stop failed");
            }
        }

        tracing::info!(node = self.config.node_id, name = %self.config.name, "store node stopped");
    }

    /// Replicate `key = value`.
    pub async fn put(&self, key: &str, value: &str) -> Result<KvResponse> {
        self.core()?.put(key, value).await
    }

    /// Replicate the removal of `key`.
    pub async fn delete(&self, key: &str) -> Result<KvResponse> {
        self.core()?.delete(key).await
    }

    /// Read `key`, optionally linearizable.
    pub async fn get(&self, key: &str, linearizable: bool) -> Result<Option<String>> {
        self.core()?.get(key, linearizable).await
    }

    /// Current status.
    pub fn status(&self) -> Result<NodeStatus> {
        self.core()?.status()
    }

    /// Checksum of the key-value data.
    pub fn hash(&self) -> Result<u32> {
        self.core()?.hash()
    }

    /// Add node `id` reachable at peer address `addr` as a learner.
    pub async fn member_add(&self, id: NodeId, addr: &str) -> Result<()> {
        self.core()?.member_add(id, addr).await
    }

    /// Promote learner `id` to voter.
    pub async fn member_promote(&self, id: NodeId) -> Result<()> {
        self.core()?.member_promote(id).await
    }

    /// Remove node `id` from the group.
    pub async fn member_remove(&self, id: NodeId) -> Result<()> {
        self.core()?.member_remove(id).await
    }
}

async fn open_db(config: &NodeConfig) -> Result<sled::Db> {
    let path = config.db_path();
    let mut attempt = 0;
    loop {
        match sled::Config::new().path(&path).open() {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(e)) if attempt + 1 < DB_OPEN_ATTEMPTS => {
                tracing::debug!(path = %path.display(), error = %e, "database busy, retrying");
                attempt += 1;
                tokio::time::sleep(DB_OPEN_BACKOFF).await;
            }
            Err(e) => return Err(StoreError::Initialization(format!("failed to open database: {}", e))),
        }
    }
}
