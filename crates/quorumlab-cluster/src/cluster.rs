//! The orchestrator owning every member of a local cluster.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::{join_all, try_join_all};
use parking_lot::{Mutex, RwLock};
use quorumlab_store::{ClusterState, NodeConfig, NodeId, NodeMember, StoreClient};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterConfig, MAX_SIZE, MEMBER_HOST};
use crate::error::{ClusterError, Result};
use crate::member::{ClientOptions, Member};
use crate::status::MemberStatus;
use crate::util;

/// Quorum of a group of `size` voters.
pub fn quorum(size: usize) -> usize {
    size / 2 + 1
}

fn member_name(id: NodeId) -> String {
    format!("node{}", id)
}

/// Node configuration of member `id` under `config`.
fn node_config(
    config: &ClusterConfig,
    id: NodeId,
    initial: Vec<NodeMember>,
) -> Result<NodeConfig> {
    let name = member_name(id);
    let (client_port, peer_port) = config.ports(id)?;
    let (election_min, election_max) = config.election_timeout_ms;
    Ok(NodeConfig::new(id, name.clone())
        .with_data_dir(config.root_dir.join(format!("{}.data", name)))
        .with_client_addr(format!("{}:{}", MEMBER_HOST, client_port))
        .with_peer_addr(format!("{}:{}", MEMBER_HOST, peer_port))
        .with_client_tls(config.client_tls.clone())
        .with_peer_tls(config.peer_tls.clone())
        .with_initial_cluster(initial)
        .with_heartbeat_interval_ms(config.heartbeat_interval_ms)
        .with_election_timeout_ms(election_min, election_max))
}

async fn promote(via: &Member, member: &Member) -> Result<()> {
    via.client()?
        .member_promote(member.id())
        .await
        .map_err(|e| ClusterError::Membership(format!("promote {}: {}", member.name(), e)))
}

/// The first real error of a fan-out, preferred over the cancellations it caused.
fn first_failure(results: Vec<Result<()>>) -> Result<()> {
    let mut canceled = false;
    for result in results {
        match result {
            Ok(()) => {}
            Err(ClusterError::Canceled) => canceled = true,
            Err(e) => return Err(e),
        }
    }
    if canceled {
        Err(ClusterError::Canceled)
    } else {
        Ok(())
    }
}

fn node_member(config: &NodeConfig) -> NodeMember {
    NodeMember::new(config.node_id, config.name.clone(), config.peer_addr.clone())
}

/// Ordered members plus the client endpoint index. Replaced as a unit so
/// readers never see one without the other.
#[derive(Debug, Default)]
struct Membership {
    members: Vec<Arc<Member>>,
    client_host_to_index: HashMap<String, usize>,
}

impl Membership {
    fn new(members: Vec<Arc<Member>>) -> Self {
        let mut membership = Self {
            members,
            client_host_to_index: HashMap::new(),
        };
        membership.reindex();
        membership
    }

    fn reindex(&mut self) {
        self.client_host_to_index = self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.endpoint(false), i))
            .collect();
    }
}

/// A local cluster of store nodes.
///
/// Member indexes are the caller-visible identity; removing a member shifts
/// the ones after it down by one. Stop, restart, add, remove and shutdown
/// run one at a time. Status reads come from the cache kept fresh by a
/// background loop and never touch the nodes.
#[derive(Debug)]
pub struct Cluster {
    started: SystemTime,
    config: ClusterConfig,

    membership: RwLock<Membership>,
    lead_idx: RwLock<Option<usize>>,
    next_id: AtomicU64,

    /// Serializes operations that change members.
    op_lock: tokio::sync::Mutex<()>,

    root: CancellationToken,
    stop_loop: CancellationToken,
    status_loop: Mutex<Option<JoinHandle<()>>>,

    client_options: ClientOptions,
}

impl Cluster {
    /// Start `config.size` members and wait until all agree on a leader.
    ///
    /// Any existing root directory is wiped first. If a member fails to
    /// start, every member started so far is torn down and the error is
    /// returned.
    pub async fn start(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;
        tracing::info!(
            size = config.size,
            root_dir = %config.root_dir.display(),
            root_port = config.root_port,
            "starting cluster"
        );

        if config.root_dir.exists() {
            util::remove_dir_all(&config.root_dir)?;
        }
        util::mkdir_all(&config.root_dir)?;

        let root = config.root.clone().unwrap_or_default();
        let client_options = ClientOptions {
            embedded: config.embedded_client,
            dial_timeout: Arc::new(RwLock::new(config.dial_timeout)),
        };

        let size = config.size as NodeId;
        let configs = (1..=size)
            .map(|id| node_config(&config, id, Vec::new()))
            .collect::<Result<Vec<_>>>()?;
        let initial: Vec<NodeMember> = configs.iter().map(node_member).collect();
        let members = configs
            .into_iter()
            .map(|c| {
                Arc::new(Member::new(
                    c.with_initial_cluster(initial.clone()),
                    root.clone(),
                    client_options.clone(),
                ))
            })
            .collect();

        let cluster = Arc::new(Self {
            started: SystemTime::now(),
            stop_loop: root.child_token(),
            config,
            membership: RwLock::new(Membership::new(members)),
            lead_idx: RwLock::new(None),
            next_id: AtomicU64::new(size + 1),
            op_lock: tokio::sync::Mutex::new(()),
            root,
            status_loop: Mutex::new(None),
            client_options,
        });

        if let Err(e) = cluster.bring_up().await {
            tracing::warn!(error = %e, "cluster failed to start, tearing down");
            cluster.teardown().await;
            return Err(e);
        }

        cluster.spawn_status_loop();
        tracing::info!(size = cluster.size(), "successfully started cluster");
        Ok(cluster)
    }

    async fn bring_up(&self) -> Result<()> {
        let members = self.members();

        // Every start runs to completion so each node handle is recorded for
        // teardown; the first failure only cuts the readiness waits short.
        let abort = self.root.child_token();
        let started = join_all(members.iter().map(|m| {
            let abort = &abort;
            async move {
                let result = m.start_until(abort).await;
                if result.is_err() {
                    abort.cancel();
                }
                result
            }
        }))
        .await;
        first_failure(started)?;

        tracing::info!("checking leader");
        let possible_leads = self.all_member_ids();
        try_join_all(members.iter().map(|m| m.wait_for_leader(&possible_leads))).await?;

        let leaders: Vec<(usize, String)> = members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.status().is_leader)
            .map(|(i, m)| (i, m.name()))
            .collect();
        if leaders.len() > 1 {
            return Err(ClusterError::DuplicateLeader(
                leaders.into_iter().map(|(_, name)| name).collect(),
            ));
        }
        *self.lead_idx.write() = leaders.first().map(|(i, _)| *i);
        Ok(())
    }

    async fn teardown(&self) {
        join_all(self.members().iter().map(|m| m.close())).await;
        if let Err(e) = util::remove_dir_all(&self.config.root_dir) {
            tracing::warn!(error = %e, "failed to remove root directory");
        }
    }

    fn spawn_status_loop(self: &Arc<Self>) {
        let cluster = Arc::downgrade(self);
        let stop = self.stop_loop.clone();
        let period = self.config.status_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = cluster.refresh_status() => {}
                }
            }
            tracing::debug!("status loop stopped");
        });
        *self.status_loop.lock() = Some(handle);
    }

    /// Refresh every member's cached status once, concurrently.
    ///
    /// Failures are logged per member and never abort the cycle.
    pub async fn refresh_status(&self) {
        let members = self.members();
        let results = join_all(members.iter().map(|m| m.fetch_member_status())).await;
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(ClusterError::Canceled) => {
                    tracing::debug!(member = %member.name(), "status refresh canceled");
                }
                Err(e) => {
                    tracing::debug!(member = %member.name(), error = %e, "status refresh failed");
                }
            }
        }
        if let Some(lead) = members.iter().position(|m| m.status().is_leader) {
            *self.lead_idx.write() = Some(lead);
        }
    }

    /// Stop member `index`. Stopping a stopped member is a no-op.
    pub async fn stop(&self, index: usize) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.member(index)?.stop().await;
        Ok(())
    }

    /// Restart stopped member `index`. Restarting a running member is a no-op.
    pub async fn restart(&self, index: usize) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.member(index)?.restart().await
    }

    /// Add a new member, returning its index.
    ///
    /// The member is registered as a learner through the first running
    /// member, started, then promoted to voter.
    pub async fn add(&self) -> Result<usize> {
        let _op = self.op_lock.lock().await;
        let members = self.members();
        if members.len() >= MAX_SIZE {
            return Err(ClusterError::Membership(format!(
                "cluster already has {} members",
                members.len()
            )));
        }
        let via = members
            .iter()
            .find(|m| !m.is_stopped())
            .cloned()
            .ok_or_else(|| ClusterError::Membership("no running member to add through".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut initial: Vec<NodeMember> =
            members.iter().map(|m| node_member(&m.config())).collect();
        let config = node_config(&self.config, id, Vec::new())?;
        initial.push(node_member(&config));
        let config = config
            .with_initial_cluster(initial)
            .with_cluster_state(ClusterState::Existing);

        tracing::info!(member = %config.name, via = %via.name(), "adding member");
        via.client()?
            .member_add(id, &config.peer_addr)
            .await
            .map_err(|e| {
                ClusterError::Membership(format!("member add via {}: {}", via.name(), e))
            })?;

        let member = Arc::new(Member::new(
            config,
            self.root.clone(),
            self.client_options.clone(),
        ));
        let joined = match member.start().await {
            Ok(()) => promote(&via, &member).await,
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            member.close().await;
            self.undo_add(&via, id).await;
            if let Err(err) = util::remove_dir_all(&member.config().data_dir) {
                tracing::warn!(member = %member.name(), error = %err, "failed to remove data dir");
            }
            return Err(e);
        }

        let index = {
            let mut membership = self.membership.write();
            membership.members.push(member.clone());
            let index = membership.members.len() - 1;
            membership
                .client_host_to_index
                .insert(member.endpoint(false), index);
            index
        };
        tracing::info!(member = %member.name(), index, "added member");
        Ok(index)
    }

    async fn undo_add(&self, via: &Member, id: NodeId) {
        let undone = match via.client() {
            Ok(client) => client.member_remove(id).await.map_err(ClusterError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = undone {
            tracing::warn!(node = id, error = %e, "failed to roll back member add");
        }
    }

    /// Remove member `index` from the group, stop it and delete its data.
    ///
    /// The removal is issued through the next member so the call never goes
    /// through the member being removed.
    pub async fn remove(&self, index: usize) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let members = self.members();
        let target = members
            .get(index)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("index {}", index)))?;
        if members.len() == 1 {
            return Err(ClusterError::Membership(
                "cannot remove the last member".into(),
            ));
        }
        let via = members[(index + 1) % members.len()].clone();

        tracing::info!(member = %target.name(), via = %via.name(), "removing member");
        via.client()?
            .member_remove(target.id())
            .await
            .map_err(|e| {
                ClusterError::Membership(format!("member remove via {}: {}", via.name(), e))
            })?;

        target.stop().await;

        {
            let mut membership = self.membership.write();
            membership.members.remove(index);
            membership.reindex();
        }
        {
            let mut lead_idx = self.lead_idx.write();
            *lead_idx = match *lead_idx {
                Some(lead) if lead == index => None,
                Some(lead) if lead > index => Some(lead - 1),
                other => other,
            };
        }
        tracing::info!(member = %target.name(), "removed member");

        // The group no longer has the member; a leftover directory is only logged.
        let data_dir = target.config().data_dir;
        if let Err(e) = util::remove_dir_all(&data_dir) {
            tracing::warn!(
                member = %target.name(),
                data_dir = %data_dir.display(),
                error = %e,
                "failed to remove data dir of removed member"
            );
        }
        Ok(())
    }

    /// Stop everything and delete the root directory.
    ///
    /// Cancels the root token, waits for the status loop to exit, then stops
    /// every running member concurrently.
    pub async fn shutdown(&self) -> Result<()> {
        self.root.cancel();
        self.stop_loop.cancel();
        let status_loop = self.status_loop.lock().take();
        if let Some(handle) = status_loop {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "status loop panicked");
            }
        }

        let _op = self.op_lock.lock().await;
        tracing::info!("shutting down all members");
        join_all(self.members().iter().map(|m| m.stop())).await;

        util::remove_dir_all(&self.config.root_dir)?;
        tracing::info!(root_dir = %self.config.root_dir.display(), "cluster shut down");
        Ok(())
    }

    /// Wait until member `index` agrees with the group on a leader.
    pub async fn wait_for_leader(&self, index: usize) -> Result<()> {
        let member = self.member(index)?;
        member.wait_for_leader(&self.all_member_ids()).await
    }

    fn members(&self) -> Vec<Arc<Member>> {
        self.membership.read().members.clone()
    }

    fn all_member_ids(&self) -> BTreeSet<NodeId> {
        self.membership.read().members.iter().map(|m| m.id()).collect()
    }

    /// Member at `index`.
    pub fn member(&self, index: usize) -> Result<Arc<Member>> {
        self.membership
            .read()
            .members
            .get(index)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("index {}", index)))
    }

    /// When the cluster was started.
    pub fn started(&self) -> SystemTime {
        self.started
    }

    /// Root token of the cluster.
    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.membership.read().members.len()
    }

    /// Members needed for the cluster to stay available.
    pub fn quorum(&self) -> usize {
        quorum(self.size())
    }

    /// Number of members not marked `Stopped`.
    pub fn active_node_n(&self) -> usize {
        self.membership
            .read()
            .members
            .iter()
            .filter(|m| !m.is_stopped())
            .count()
    }

    /// Index of the member last seen leading.
    pub fn lead_idx(&self) -> Option<usize> {
        *self.lead_idx.read()
    }

    pub fn is_stopped(&self, index: usize) -> Result<bool> {
        Ok(self.member(index)?.is_stopped())
    }

    pub fn member_status(&self, index: usize) -> Result<MemberStatus> {
        Ok(self.member(index)?.status())
    }

    pub fn all_member_status(&self) -> Vec<MemberStatus> {
        self.membership
            .read()
            .members
            .iter()
            .map(|m| m.status())
            .collect()
    }

    pub fn stopped_started_at(&self, index: usize) -> Result<SystemTime> {
        Ok(self.member(index)?.stopped_started_at())
    }

    pub fn config(&self, index: usize) -> Result<NodeConfig> {
        Ok(self.member(index)?.config())
    }

    pub fn all_configs(&self) -> Vec<NodeConfig> {
        self.membership
            .read()
            .members
            .iter()
            .map(|m| m.config())
            .collect()
    }

    /// Client endpoints of member `index`.
    pub fn endpoints(&self, index: usize, scheme: bool) -> Result<Vec<String>> {
        Ok(vec![self.member(index)?.endpoint(scheme)])
    }

    /// Client endpoint of every member, in index order.
    pub fn all_endpoints(&self, scheme: bool) -> Vec<String> {
        self.membership
            .read()
            .members
            .iter()
            .map(|m| m.endpoint(scheme))
            .collect()
    }

    /// `name=peer-url` pairs of every member, comma separated.
    pub fn initial_cluster(&self) -> String {
        self.membership
            .read()
            .members
            .iter()
            .map(|m| {
                let config = m.config();
                format!("{}={}", config.name, config.peer_url())
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Index of the member serving `endpoint` (bare `host:port` or URL).
    pub fn find_index(&self, endpoint: &str) -> Option<usize> {
        self.membership
            .read()
            .client_host_to_index
            .get(util::get_host(endpoint))
            .copied()
    }

    /// Timeout used by member clients created from now on.
    pub fn set_client_dial_timeout(&self, timeout: Duration) {
        *self.client_options.dial_timeout.write() = timeout;
    }

    /// A client for member `index`.
    pub fn client(&self, index: usize) -> Result<StoreClient> {
        self.member(index)?.client()
    }

    /// A client for the member serving `endpoint`.
    pub fn client_for_endpoint(&self, endpoint: &str) -> Result<StoreClient> {
        let index = self.find_index(endpoint).ok_or_else(|| {
            ClusterError::NotFound(format!("cannot find member with endpoint {}", endpoint))
        })?;
        self.client(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
        assert_eq!(quorum(7), 4);
    }

    #[test]
    fn test_node_config_layout() {
        let config = ClusterConfig::new(3, "/tmp/lab").with_root_port(2379);
        let node = node_config(&config, 2, Vec::new()).unwrap();
        assert_eq!(node.name, "node2");
        assert_eq!(node.node_id, 2);
        assert_eq!(node.client_addr, "127.0.0.1:2381");
        assert_eq!(node.peer_addr, "127.0.0.1:2382");
        assert_eq!(node.data_dir, std::path::PathBuf::from("/tmp/lab/node2.data"));
        assert_eq!(node.cluster_state, ClusterState::New);
    }

    #[test]
    fn test_membership_index() {
        let root = CancellationToken::new();
        let options = ClientOptions {
            embedded: false,
            dial_timeout: Arc::new(RwLock::new(Duration::from_secs(1))),
        };
        let config = ClusterConfig::new(3, "/tmp/lab").with_root_port(2379);
        let members: Vec<_> = (1..=3)
            .map(|id| {
                Arc::new(Member::new(
                    node_config(&config, id, Vec::new()).unwrap(),
                    root.clone(),
                    options.clone(),
                ))
            })
            .collect();

        let mut membership = Membership::new(members);
        assert_eq!(membership.client_host_to_index.get("127.0.0.1:2381"), Some(&1));

        membership.members.remove(0);
        membership.reindex();
        assert_eq!(membership.client_host_to_index.get("127.0.0.1:2379"), None);
        assert_eq!(membership.client_host_to_index.get("127.0.0.1:2381"), Some(&0));
        assert_eq!(membership.client_host_to_index.get("127.0.0.1:2383"), Some(&1));
    }

    #[test]
    fn test_first_failure_prefers_cause() {
        assert!(first_failure(vec![Ok(()), Ok(())]).is_ok());

        let results = vec![
            Err(ClusterError::Canceled),
            Err(ClusterError::Start {
                name: "node2".into(),
                reason: "address in use".into(),
            }),
            Ok(()),
        ];
        assert!(matches!(
            first_failure(results),
            Err(ClusterError::Start { name, .. }) if name == "node2"
        ));

        assert!(matches!(
            first_failure(vec![Ok(()), Err(ClusterError::Canceled)]),
            Err(ClusterError::Canceled)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_shutdown_interrupts_slow_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig::new(3, dir.path().join("lab"))
            .with_root_port(44500)
            .with_raft_timing(50, 150, 300)
            .with_status_interval(Duration::from_millis(100))
            .with_dial_timeout(Duration::from_secs(30));
        let cluster = Cluster::start(config).await.unwrap();

        // node3 dies and its client port now accepts connections without answering.
        let member = cluster.member(2).unwrap();
        member.close().await;
        let silent = std::net::TcpListener::bind(member.endpoint(false)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(5), cluster.shutdown())
            .await
            .expect("shutdown waited on the stuck refresh")
            .unwrap();
        assert!(cluster.root().is_cancelled());
        assert!(!dir.path().join("lab").exists());
        drop(silent);
    }
}
