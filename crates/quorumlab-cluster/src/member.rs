//! One store node and its cached health.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use quorumlab_store::{
    ClusterState, NodeConfig, NodeId, NodeStatus, StoreClient, StoreError, StoreNode,
};
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};
use crate::humanize;
use crate::status::{format_id, MemberState, MemberStatus};

/// Timeout of the status and hash calls made by a refresh.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout of each call made while waiting for a leader.
pub const LEADER_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause between leader polls.
pub const LEADER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between failed leader-reachability reads.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// How member clients reach their node. Shared by every member of a cluster.
#[derive(Debug, Clone)]
pub(crate) struct ClientOptions {
    pub embedded: bool,
    pub dial_timeout: Arc<RwLock<Duration>>,
}

#[derive(Debug)]
struct Tracked {
    status: MemberStatus,
    /// Time of the last start, stop or restart.
    stopped_started_at: SystemTime,
}

/// A cluster member wrapping one [`StoreNode`].
#[derive(Debug)]
pub struct Member {
    config: RwLock<NodeConfig>,
    node: RwLock<Option<Arc<StoreNode>>>,
    tracked: RwLock<Tracked>,
    root: CancellationToken,
    client_options: ClientOptions,
}

impl Member {
    pub(crate) fn new(
        config: NodeConfig,
        root: CancellationToken,
        client_options: ClientOptions,
    ) -> Self {
        let status = MemberStatus::new(config.name.clone(), config.client_url());
        Self {
            config: RwLock::new(config),
            node: RwLock::new(None),
            tracked: RwLock::new(Tracked {
                status,
                stopped_started_at: SystemTime::now(),
            }),
            root,
            client_options,
        }
    }

    /// Member name (`node1`, `node2`, ...).
    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    /// Raft ID of the member's node.
    pub fn id(&self) -> NodeId {
        self.config.read().node_id
    }

    /// Current node configuration.
    pub fn config(&self) -> NodeConfig {
        self.config.read().clone()
    }

    /// Client endpoint, as a URL when `scheme` is set, else `host:port`.
    pub fn endpoint(&self, scheme: bool) -> String {
        let config = self.config.read();
        if scheme {
            config.client_url()
        } else {
            config.client_addr.clone()
        }
    }

    /// Cached status.
    pub fn status(&self) -> MemberStatus {
        self.tracked.read().status.clone()
    }

    /// True when the cached status says the member is down.
    pub fn is_stopped(&self) -> bool {
        self.tracked.read().status.is_stopped()
    }

    /// Time of the last start, stop or restart.
    pub fn stopped_started_at(&self) -> SystemTime {
        self.tracked.read().stopped_started_at
    }

    fn node(&self) -> Option<Arc<StoreNode>> {
        self.node.read().clone()
    }

    fn is_running(&self) -> bool {
        self.node.read().as_ref().is_some_and(|n| !n.is_stopped())
    }

    /// A client for this member's node.
    pub fn client(&self) -> Result<StoreClient> {
        if self.client_options.embedded {
            let node = self
                .node()
                .ok_or_else(|| StoreError::Stopped(self.name()))?;
            return Ok(StoreClient::embedded(node));
        }
        let config = self.config.read();
        let timeout = *self.client_options.dial_timeout.read();
        Ok(StoreClient::connect(
            &config.client_addr,
            &config.client_tls,
            timeout,
        )?)
    }

    /// Launch the node and wait until it is ready.
    ///
    /// Fails if the node reports an error or stops before it sees a leader.
    pub async fn start(&self) -> Result<()> {
        self.start_until(&self.root).await
    }

    /// [`start`](Self::start), giving up on readiness once `cancel` fires.
    ///
    /// The node handle is kept even then, so a later `close` tears it down.
    pub(crate) async fn start_until(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.config();
        let name = config.name.clone();

        let node = StoreNode::start(config.clone())
            .await
            .map_err(|e| ClusterError::Start {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let node = Arc::new(node);
        *self.node.write() = Some(node.clone());

        let outcome = tokio::select! {
            ready = node.ready() => ready.map_err(|e| e.to_string()),
            err = node.error() => Err(err),
            _ = node.stopped() => Err("node stopped before becoming ready".to_string()),
            _ = cancel.cancelled() => return Err(ClusterError::Canceled),
        };
        outcome.map_err(|reason| ClusterError::Start {
            name: name.clone(),
            reason,
        })?;

        let now = SystemTime::now();
        {
            let mut tracked = self.tracked.write();
            tracked.stopped_started_at = now;
            let status = &mut tracked.status;
            status.id = format_id(node.id());
            status.state = MemberState::Follower;
            status.state_txt = format!("{} just started ({})", name, humanize::time(now));
            status.is_leader = false;
        }

        tracing::info!(
            member = %name,
            client = %config.client_url(),
            peer = %config.peer_url(),
            "started member"
        );
        Ok(())
    }

    /// Start the node again as a member of the existing group.
    ///
    /// Does not wait for readiness: without quorum the node never gets
    /// ready. The status says `Follower` until a refresh learns better.
    pub async fn restart(&self) -> Result<()> {
        let name = self.name();
        if self.is_running() {
            tracing::warn!(member = %name, "member is already started");
            return Ok(());
        }
        tracing::info!(member = %name, id = %format_id(self.id()), "restarting member");

        let config = {
            let mut config = self.config.write();
            config.cluster_state = ClusterState::Existing;
            config.clone()
        };

        let node = StoreNode::start(config)
            .await
            .map_err(|e| ClusterError::Start {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        *self.node.write() = Some(Arc::new(node));

        let now = SystemTime::now();
        {
            let mut tracked = self.tracked.write();
            tracked.stopped_started_at = now;
            let status = &mut tracked.status;
            status.is_leader = false;
            status.state = MemberState::Follower;
            status.state_txt = format!("{} just restarted ({})", name, humanize::time(now));
        }

        tracing::info!(member = %name, "restarted member");
        Ok(())
    }

    /// Hard-stop the node, as if it crashed.
    ///
    /// The status flips to `Stopped` before teardown begins. Stopping a
    /// member that is not running only logs a warning.
    pub async fn stop(&self) {
        let name = self.name();
        let now = SystemTime::now();

        // Mark and detach under one lock so a refresh never sees a
        // stopped status next to a live handle.
        let node = {
            let mut tracked = self.tracked.write();
            let mut slot = self.node.write();
            match slot.take() {
                Some(node) if !node.is_stopped() => {
                    tracked.stopped_started_at = now;
                    tracked
                        .status
                        .mark_stopped(format!("{} just stopped ({})", name, humanize::time(now)));
                    Some(node)
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        let Some(node) = node else {
            tracing::warn!(member = %name, "member is already stopped");
            return;
        };

        tracing::info!(member = %name, id = %format_id(self.id()), "stopping member");
        node.hard_stop().await;
        tracing::info!(member = %name, "stopped member");
    }

    /// Tear down the node handle without touching the status.
    pub(crate) async fn close(&self) {
        let node = self.node.write().take();
        if let Some(node) = node {
            node.hard_stop().await;
        }
    }

    /// Wait until this member agrees with the group on a leader.
    ///
    /// First proves a leader exists with a linearizable read, then polls
    /// until the reported leader is one of `possible_leads` and two
    /// consecutive observations match. Retries until the root token is
    /// canceled. Returns at once for a stopped member.
    pub async fn wait_for_leader(&self, possible_leads: &BTreeSet<NodeId>) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let name = self.name();
        let client = self.connect(LEADER_CHECK_TIMEOUT).await?;

        loop {
            match self.bounded(LEADER_CHECK_TIMEOUT, client.get("0", true)).await {
                Ok(_) => break,
                Err(ClusterError::Canceled) => return Err(ClusterError::Canceled),
                Err(e) => {
                    tracing::warn!(member = %name, error = %e, "leader not reachable yet");
                    self.pause(READ_RETRY_BACKOFF).await?;
                }
            }
        }

        loop {
            let mut lead: NodeId = 0;
            while lead == 0 || !possible_leads.contains(&lead) {
                let Some(node) = self.node() else {
                    return Ok(());
                };
                lead = node.status().map(|s| s.leader).unwrap_or(0);
                self.pause(LEADER_POLL_INTERVAL).await?;
            }

            let resp: NodeStatus =
                match self.bounded(LEADER_CHECK_TIMEOUT, client.status()).await {
                    Ok(resp) => resp,
                    Err(ClusterError::Canceled) => return Err(ClusterError::Canceled),
                    Err(e) => {
                        tracing::warn!(member = %name, error = %e, "status failed");
                        self.pause(LEADER_POLL_INTERVAL).await?;
                        continue;
                    }
                };

            let id = format_id(resp.id);
            if resp.leader == 0 {
                tracing::info!(member = %name, id = %id, "no leader yet");
                {
                    let mut tracked = self.tracked.write();
                    tracked.status.id = id;
                    tracked.status.set_leader(false);
                }
                self.pause(LEADER_POLL_INTERVAL).await?;
                continue;
            }

            tracing::info!(
                member = %name,
                id = %id,
                leader = %format_id(resp.leader),
                "member has leader"
            );
            {
                let mut tracked = self.tracked.write();
                tracked.status.id = id;
                tracked.status.set_leader(resp.is_leader());
            }

            if lead == resp.leader {
                return Ok(());
            }
        }
    }

    /// Refresh the cached status from the node.
    ///
    /// A stopped member is not queried, only its status text is updated.
    /// Any failed call marks the member `Stopped` with an explanation and
    /// returns [`ClusterError::StatusFetch`].
    pub async fn fetch_member_status(&self) -> Result<()> {
        let (name, since, stopped) = {
            let tracked = self.tracked.read();
            (
                tracked.status.name.clone(),
                tracked.stopped_started_at,
                tracked.status.is_stopped(),
            )
        };

        if stopped && !self.is_running() {
            self.commit(since, |status| {
                status.state_txt =
                    format!("{} has been stopped (since {})", name, humanize::time(since));
            });
            tracing::debug!(member = %name, "member is stopped, skipping status refresh");
            return Ok(());
        }

        let now = SystemTime::now();
        let client = match self.connect(STATUS_TIMEOUT).await {
            Ok(client) => client,
            Err(ClusterError::Canceled) => return Err(ClusterError::Canceled),
            Err(e) => {
                return Err(self.unreachable(&name, since, "is not reachable", now, e));
            }
        };

        let resp = match self.bounded(STATUS_TIMEOUT, client.status()).await {
            Ok(resp) => resp,
            Err(ClusterError::Canceled) => return Err(ClusterError::Canceled),
            Err(e) => {
                return Err(self.unreachable(&name, since, "is not reachable", now, e));
            }
        };

        let mut status = MemberStatus {
            name: name.clone(),
            id: format_id(resp.id),
            endpoint: self.endpoint(true),
            state_txt: format!("{} has been healthy (since {})", name, humanize::time(since)),
            db_size: resp.db_size,
            db_size_txt: humanize::bytes(resp.db_size),
            ..Default::default()
        };
        status.set_leader(resp.is_leader());

        let now = SystemTime::now();
        status.hash = match self.bounded(STATUS_TIMEOUT, client.hash()).await {
            Ok(hash) => hash,
            Err(ClusterError::Canceled) => return Err(ClusterError::Canceled),
            Err(e) => {
                return Err(self.unreachable(
                    &name,
                    since,
                    "was not reachable while getting hash",
                    now,
                    e,
                ));
            }
        };

        if !self.commit_running(since, status) {
            tracing::debug!(member = %name, "member changed state during refresh, dropping result");
        }
        Ok(())
    }

    /// Mark the member down after a failed call and build the error.
    fn unreachable(
        &self,
        name: &str,
        since: SystemTime,
        what: &str,
        at: SystemTime,
        err: ClusterError,
    ) -> ClusterError {
        tracing::warn!(member = %name, error = %err, "{}", what);
        let reason = err.to_string();
        self.commit(since, |status| {
            status.mark_stopped(format!(
                "{} {} ({} - {})",
                name,
                what,
                humanize::time(at),
                reason
            ));
        });
        ClusterError::StatusFetch {
            name: name.to_string(),
            reason,
        }
    }

    /// Apply `update` unless a start, stop or restart happened after `since`.
    fn commit(&self, since: SystemTime, update: impl FnOnce(&mut MemberStatus)) {
        let mut tracked = self.tracked.write();
        if tracked.stopped_started_at == since {
            update(&mut tracked.status);
        }
    }

    /// Replace the status with a healthy one, only if no start, stop or
    /// restart happened after `since` and the node is still running.
    fn commit_running(&self, since: SystemTime, status: MemberStatus) -> bool {
        let mut tracked = self.tracked.write();
        if tracked.stopped_started_at != since || !self.is_running() {
            return false;
        }
        tracked.status = status;
        true
    }

    /// Like [`client`](Self::client), but a remote dial runs on a blocking
    /// thread bounded by `timeout` and the root token.
    async fn connect(&self, timeout: Duration) -> Result<StoreClient> {
        if self.client_options.embedded {
            return self.client();
        }
        let (addr, tls) = {
            let config = self.config.read();
            (config.client_addr.clone(), config.client_tls.clone())
        };
        let dial_timeout = *self.client_options.dial_timeout.read();
        let dial = async move {
            tokio::task::spawn_blocking(move || StoreClient::connect(&addr, &tls, dial_timeout))
                .await
                .map_err(|e| StoreError::Internal(format!("dial task failed: {}", e)))?
        };
        self.bounded(timeout, dial).await
    }

    /// Run a store call bounded by `timeout` and the root token.
    async fn bounded<T, F>(&self, timeout: Duration, call: F) -> Result<T>
    where
        F: Future<Output = quorumlab_store::Result<T>>,
    {
        tokio::select! {
            _ = self.root.cancelled() => Err(ClusterError::Canceled),
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(res) => res.map_err(ClusterError::from),
                Err(_) => Err(ClusterError::Store(StoreError::Timeout(format!(
                    "no response within {:?}",
                    timeout
                )))),
            },
        }
    }

    async fn pause(&self, period: Duration) -> Result<()> {
        tokio::select! {
            _ = self.root.cancelled() => Err(ClusterError::Canceled),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(dir: &std::path::Path, port: u16, embedded: bool) -> Member {
        let peer_addr = format!("127.0.0.1:{}", port + 1);
        let config = NodeConfig::new(1, "node1")
            .with_data_dir(dir.join("node1.data"))
            .with_client_addr(format!("127.0.0.1:{}", port))
            .with_peer_addr(peer_addr.clone())
            .with_initial_cluster(vec![quorumlab_store::NodeMember::new(1, "node1", peer_addr)])
            .with_election_timeout_ms(150, 300)
            .with_heartbeat_interval_ms(50);
        Member::new(
            config,
            CancellationToken::new(),
            ClientOptions {
                embedded,
                dial_timeout: Arc::new(RwLock::new(Duration::from_secs(1))),
            },
        )
    }

    #[test]
    fn test_new_member_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let m = member(dir.path(), 44379, false);
        assert!(m.is_stopped());
        assert_eq!(m.name(), "node1");
        assert_eq!(m.endpoint(false), "127.0.0.1:44379");
        assert_eq!(m.endpoint(true), "tcp://127.0.0.1:44379");
        assert!(m.status().id.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_member_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let m = member(dir.path(), 44389, true);

        m.start().await.unwrap();
        assert_eq!(m.status().state, MemberState::Follower);
        assert!(m.status().state_txt.starts_with("node1 just started"));

        m.wait_for_leader(&BTreeSet::from([1])).await.unwrap();
        let status = m.status();
        assert_eq!(status.state, MemberState::Leader);
        assert_eq!(status.id, "1");

        m.client().unwrap().put("foo", "bar").await.unwrap();
        m.fetch_member_status().await.unwrap();
        let status = m.status();
        assert!(status.is_leader);
        assert!(status.db_size > 0);
        assert_ne!(status.hash, 0);
        assert!(status.state_txt.starts_with("node1 has been healthy (since"));
        let hash = status.hash;

        m.stop().await;
        let status = m.status();
        assert_eq!(status.state, MemberState::Stopped);
        assert_eq!((status.db_size, status.hash, status.is_leader), (0, 0, false));

        // Second stop is a no-op.
        let before = m.stopped_started_at();
        m.stop().await;
        assert_eq!(m.stopped_started_at(), before);

        m.fetch_member_status().await.unwrap();
        assert!(m.status().state_txt.starts_with("node1 has been stopped (since"));

        m.restart().await.unwrap();
        assert_eq!(m.status().state, MemberState::Follower);
        assert!(m.status().state_txt.starts_with("node1 just restarted"));

        // Restart while running is a no-op.
        let before = m.stopped_started_at();
        m.restart().await.unwrap();
        assert_eq!(m.stopped_started_at(), before);

        m.wait_for_leader(&BTreeSet::from([1])).await.unwrap();
        m.fetch_member_status().await.unwrap();
        assert_eq!(m.status().hash, hash);

        m.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_marks_unreachable_member() {
        let dir = tempfile::tempdir().unwrap();
        let m = member(dir.path(), 44399, false);
        m.start().await.unwrap();
        let since = m.stopped_started_at();

        // Kill the node behind the member's back.
        m.close().await;
        let err = m.fetch_member_status().await.unwrap_err();
        assert!(matches!(err, ClusterError::StatusFetch { .. }));

        let status = m.status();
        assert_eq!(status.state, MemberState::Stopped);
        assert!(status.state_txt.starts_with("node1 is not reachable ("));
        assert_eq!(m.stopped_started_at(), since);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_wins_over_concurrent_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let m = Arc::new(member(dir.path(), 44409, true));
        m.start().await.unwrap();
        m.wait_for_leader(&BTreeSet::from([1])).await.unwrap();
        m.client().unwrap().put("foo", "bar").await.unwrap();

        let done = CancellationToken::new();
        let refresher = {
            let m = m.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.is_cancelled() {
                    let _ = m.fetch_member_status().await;
                    tokio::task::yield_now().await;
                }
                let _ = m.fetch_member_status().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        m.stop().await;
        done.cancel();
        refresher.await.unwrap();

        let status = m.status();
        assert_eq!(status.state, MemberState::Stopped);
        assert_eq!((status.db_size, status.hash, status.is_leader), (0, 0, false));
        assert!(status.state_txt.starts_with("node1 has been stopped (since"));
    }
}
