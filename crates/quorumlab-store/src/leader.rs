//! Leader-only operations and their forwarding from followers.

use std::collections::BTreeSet;
use std::time::Duration;

use openraft::{BasicNode, ChangeMembers};

use crate::config::TlsInfo;
use crate::error::StoreError;
use crate::network::messages::{LeaderReply, LeaderRequest, RaftMessage};
use crate::network::transport::round_trip;
use crate::types::StoreRaft;

/// Execute a leader-only request against the local raft instance.
///
/// Fails with a `Failed` reply if this node is not the leader.
pub(crate) async fn execute_on_leader(raft: &StoreRaft, request: LeaderRequest) -> LeaderReply {
    match execute(raft, request).await {
        Ok(reply) => reply,
        Err(e) => LeaderReply::Failed(e.to_string()),
    }
}

async fn execute(raft: &StoreRaft, request: LeaderRequest) -> Result<LeaderReply, StoreError> {
    match request {
        LeaderRequest::Write(command) => {
            let resp = raft
                .client_write(command)
                .await
                .map_err(|e| StoreError::Write(e.to_string()))?;
            Ok(LeaderReply::Written(resp.data))
        }
        LeaderRequest::AddLearner { id, addr } => {
            // Non-blocking: the learner may not be running yet.
            raft.add_learner(id, BasicNode { addr }, false)
                .await
                .map_err(|e| StoreError::MembershipChange(e.to_string()))?;
            tracing::info!(node = id, "added learner");
            Ok(LeaderReply::MembershipChanged)
        }
        LeaderRequest::Promote { id } => {
            raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
                .await
                .map_err(|e| StoreError::MembershipChange(e.to_string()))?;
            tracing::info!(node = id, "promoted learner to voter");
            Ok(LeaderReply::MembershipChanged)
        }
        LeaderRequest::Remove { id } => {
            let is_voter = raft
                .metrics()
                .borrow()
                .membership_config
                .membership()
                .voter_ids()
                .any(|voter| voter == id);
            // A learner that never got promoted is dropped as a plain node.
            let change = if is_voter {
                ChangeMembers::RemoveVoters(BTreeSet::from([id]))
            } else {
                ChangeMembers::RemoveNodes(BTreeSet::from([id]))
            };
            raft.change_membership(change, false)
                .await
                .map_err(|e| StoreError::MembershipChange(e.to_string()))?;
            tracing::info!(node = id, "removed member");
            Ok(LeaderReply::MembershipChanged)
        }
        LeaderRequest::ReadIndex => {
            let read_log_id = raft
                .ensure_linearizable()
                .await
                .map_err(|e| StoreError::Read(e.to_string()))?;
            Ok(LeaderReply::ReadIndex(read_log_id.map(|l| l.index)))
        }
    }
}

/// Run `request` on the current leader, locally or over the peer transport.
///
/// A `Failed` reply from the leader is turned into [`StoreError::Remote`].
pub(crate) async fn submit(
    raft: &StoreRaft,
    peer_tls: &TlsInfo,
    timeout: Duration,
    request: LeaderRequest,
) -> Result<LeaderReply, StoreError> {
    let metrics = raft.metrics().borrow().clone();
    let leader = metrics.current_leader.ok_or(StoreError::NoLeader)?;

    let reply = if leader == metrics.id {
        execute_on_leader(raft, request).await
    } else {
        let addr = metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|n| n.addr.clone())
            .ok_or(StoreError::NotLeader {
                leader_id: Some(leader),
                leader_addr: None,
            })?;

        tracing::debug!(leader, addr = %addr, "forwarding to leader");
        let url = peer_tls.url(&addr);
        let tls = peer_tls.clone();
        let msg = RaftMessage::Forward(request);

        let response: RaftMessage =
            tokio::task::spawn_blocking(move || round_trip(&url, &tls, timeout, &msg))
                .await
                .map_err(|e| StoreError::Internal(format!("task join failed: {}", e)))??;

        match response {
            RaftMessage::Forwarded(reply) => reply,
            RaftMessage::Error(msg) => return Err(StoreError::Remote(msg)),
            other => {
                return Err(StoreError::Remote(format!("unexpected reply: {:?}", other)));
            }
        }
    };

    match reply {
        LeaderReply::Failed(msg) => Err(StoreError::Remote(msg)),
        reply => Ok(reply),
    }
}
