//! Guarded operations on the running cluster.
//!
//! Every disruptive call re-checks member state and quorum against the
//! latest cached status, then asks the limiter for its resource. The
//! limiter is only advanced once the operation actually ran.

use std::sync::Arc;
use std::time::Duration;

use quorumlab_cluster::{quorum, Cluster, ClusterError, MemberStatus, RequestLimiter};
use quorumlab_store::KvResponse;

use crate::config::LimitConfig;
use crate::error::{Error, Result};

/// A rate-limited class of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Stop and restart.
    StopRestart,
    /// Add and remove.
    Membership,
    /// Put and delete.
    Write,
}

/// The single place callers go through to change the cluster.
#[derive(Debug)]
pub struct ControlPlane {
    cluster: Arc<Cluster>,
    stop_restart: RequestLimiter,
    membership: RequestLimiter,
    write: RequestLimiter,
}

impl ControlPlane {
    /// Guard `cluster` with limiters scoped to its root token.
    pub fn new(cluster: Arc<Cluster>, limits: &LimitConfig) -> Self {
        let root = cluster.root().clone();
        Self {
            stop_restart: RequestLimiter::new(root.clone(), limits.stop_restart),
            membership: RequestLimiter::new(root.clone(), limits.membership),
            write: RequestLimiter::new(root, limits.write),
            cluster,
        }
    }

    /// The guarded cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Limiter of `resource`.
    pub fn limiter(&self, resource: Resource) -> &RequestLimiter {
        match resource {
            Resource::StopRestart => &self.stop_restart,
            Resource::Membership => &self.membership,
            Resource::Write => &self.write,
        }
    }

    /// Change the spacing of `resource` requests.
    pub fn set_interval(&self, resource: Resource, interval: Duration) {
        self.limiter(resource).set_interval(interval);
    }

    async fn admit(&self, resource: Resource) -> Result<()> {
        let decision = self.limiter(resource).check().await;
        if decision.is_ok() {
            Ok(())
        } else {
            tracing::debug!(?resource, reason = %decision, "request rejected");
            Err(Error::RateLimited(decision.message()))
        }
    }

    /// Stop member `index`, refusing if that would break quorum.
    pub async fn stop(&self, index: usize) -> Result<String> {
        let status = self.cluster.member_status(index)?;
        if status.is_stopped() {
            return Err(already(&status));
        }
        stop_keeps_quorum(&status.name, self.cluster.active_node_n(), self.cluster.quorum())?;

        self.admit(Resource::StopRestart).await?;
        self.cluster.stop(index).await?;
        self.stop_restart.advance();
        Ok(format!("stopped {}", status.name))
    }

    /// Restart stopped member `index`.
    pub async fn restart(&self, index: usize) -> Result<String> {
        let status = self.cluster.member_status(index)?;
        if !status.is_stopped() {
            return Err(already(&status));
        }

        self.admit(Resource::StopRestart).await?;
        self.cluster.restart(index).await?;
        self.stop_restart.advance();
        Ok(format!("restarted {}", status.name))
    }

    /// Add a member, returning a message with its index.
    pub async fn add(&self) -> Result<String> {
        self.admit(Resource::Membership).await?;
        let index = self.cluster.add().await?;
        self.membership.advance();
        let status = self.cluster.member_status(index)?;
        Ok(format!("added {} at index {}", status.name, index))
    }

    /// Remove member `index`, refusing if the rest would lack quorum.
    pub async fn remove(&self, index: usize) -> Result<String> {
        let status = self.cluster.member_status(index)?;
        remove_keeps_quorum(
            &status,
            self.cluster.size(),
            self.cluster.active_node_n(),
        )?;

        self.admit(Resource::Membership).await?;
        self.cluster.remove(index).await?;
        self.membership.advance();
        Ok(format!("removed {}", status.name))
    }

    /// Write `key = value` through member `index`.
    pub async fn put(&self, index: usize, key: &str, value: &str) -> Result<KvResponse> {
        let client = self.cluster.client(index)?;
        self.admit(Resource::Write).await?;
        let resp = client.put(key, value).await?;
        self.write.advance();
        Ok(resp)
    }

    /// Delete `key` through member `index`.
    pub async fn delete(&self, index: usize, key: &str) -> Result<KvResponse> {
        let client = self.cluster.client(index)?;
        self.admit(Resource::Write).await?;
        let resp = client.delete(key).await?;
        self.write.advance();
        Ok(resp)
    }

    /// Linearizable read of `key` through member `index`.
    pub async fn get(&self, index: usize, key: &str) -> Result<Option<String>> {
        Ok(self.cluster.client(index)?.get(key, true).await?)
    }

    /// Cached status of every member.
    pub fn status(&self) -> Vec<MemberStatus> {
        self.cluster.all_member_status()
    }
}

// Status and active count are read separately and may straddle a refresh,
// so the arithmetic below must not assume they agree.

fn stop_keeps_quorum(name: &str, active: usize, needed: usize) -> Result<()> {
    if active <= needed {
        return Err(Error::Quorum(format!(
            "stopping {} would leave {} active members, quorum is {}",
            name,
            active.saturating_sub(1),
            needed
        )));
    }
    Ok(())
}

fn remove_keeps_quorum(status: &MemberStatus, size: usize, active: usize) -> Result<()> {
    if size <= 1 {
        return Err(Error::Quorum("cannot remove the last member".to_string()));
    }
    let remaining_active = active.saturating_sub(usize::from(!status.is_stopped()));
    let needed = quorum(size - 1);
    if remaining_active < needed {
        return Err(Error::Quorum(format!(
            "removing {} would leave {} active of {} members, quorum is {}",
            status.name,
            remaining_active,
            size - 1,
            needed
        )));
    }
    Ok(())
}

fn already(status: &MemberStatus) -> Error {
    Error::Cluster(ClusterError::AlreadyInState {
        name: status.name.clone(),
        state: status.state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumlab_cluster::MemberState;

    fn running(name: &str) -> MemberStatus {
        let mut status = MemberStatus::new(name.to_string(), String::new());
        status.state = MemberState::Follower;
        status
    }

    #[test]
    fn test_stop_quorum_guard() {
        assert!(stop_keeps_quorum("node1", 5, 3).is_ok());
        assert!(matches!(stop_keeps_quorum("node1", 3, 3), Err(Error::Quorum(_))));

        // A count refreshed after the status was read can already be zero.
        let err = stop_keeps_quorum("node1", 0, 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "refused: stopping node1 would leave 0 active members, quorum is 2"
        );
    }

    #[test]
    fn test_remove_quorum_guard() {
        assert!(remove_keeps_quorum(&running("node1"), 3, 3).is_ok());
        assert!(remove_keeps_quorum(&running("node1"), 3, 1).is_err());
        assert!(remove_keeps_quorum(&running("node1"), 1, 1).is_err());
        assert!(remove_keeps_quorum(&MemberStatus::default(), 3, 2).is_ok());

        let err = remove_keeps_quorum(&running("node2"), 3, 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "refused: removing node2 would leave 0 active of 2 members, quorum is 2"
        );
    }
}
