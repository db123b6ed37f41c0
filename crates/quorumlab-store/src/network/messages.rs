//! Wire messages exchanged over the peer and client sockets.
//!
//! Everything is JSON. Raft RPCs carry openraft's own request/response types,
//! which are serde-enabled through the `serde` feature.

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use crate::types::{KvCommand, KvResponse, NodeId, TypeConfig};

/// Peer-to-peer message.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftMessage {
    /// RequestVote RPC.
    Vote(VoteRequest<NodeId>),
    /// RequestVote reply.
    VoteReply(VoteResponse<NodeId>),
    /// AppendEntries RPC (also heartbeats).
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    /// AppendEntries reply.
    AppendEntriesReply(AppendEntriesResponse<NodeId>),
    /// One chunk of a snapshot transfer.
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// Snapshot chunk acknowledgement.
    InstallSnapshotReply(InstallSnapshotResponse<NodeId>),
    /// A leader-only request forwarded by a follower.
    Forward(LeaderRequest),
    /// Result of a forwarded request.
    Forwarded(LeaderReply),
    /// The receiver could not handle the message.
    Error(String),
}

/// Requests only the raft leader can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderRequest {
    /// Replicate a command.
    Write(KvCommand),
    /// Add a node as a non-voting learner.
    AddLearner { id: NodeId, addr: String },
    /// Turn a learner into a voter.
    Promote { id: NodeId },
    /// Drop a node from the voter set.
    Remove { id: NodeId },
    /// Confirm leadership and return the commit index to wait for.
    ReadIndex,
}

/// Outcome of a [`LeaderRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderReply {
    /// The command was committed and applied.
    Written(KvResponse),
    /// The membership change was committed.
    MembershipChanged,
    /// Leadership confirmed; reads are safe once this index is applied locally.
    ReadIndex(Option<u64>),
    /// The request failed on the leader.
    Failed(String),
}

/// Client-to-node request served on the client listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Put { key: String, value: String },
    Get { key: String, linearizable: bool },
    Delete { key: String },
    Status,
    Hash,
    MemberAdd { id: NodeId, addr: String },
    MemberPromote { id: NodeId },
    MemberRemove { id: NodeId },
}

/// Reply to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Written(KvResponse),
    Value(Option<String>),
    Status(NodeStatus),
    Hash(u32),
    Done,
    Error(String),
}

/// Point-in-time view of a node as reported by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Raft ID of the reporting node.
    pub id: NodeId,
    /// Raft ID of the leader this node currently follows; 0 when unknown.
    pub leader: NodeId,
    /// Bytes used on disk by the node's database.
    pub db_size: u64,
    /// Current raft term.
    pub term: u64,
    /// Index of the last applied log entry.
    pub applied_index: u64,
}

impl NodeStatus {
    /// True if the node believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.leader != 0 && self.leader == self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_message_decodes() {
        let vote = openraft::Vote::new(1, 5);
        let last_log_id = Some(openraft::LogId::new(openraft::CommittedLeaderId::new(1, 1), 10));
        let msg = RaftMessage::Vote(VoteRequest::new(vote, last_log_id));

        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<RaftMessage>(&json).unwrap() {
            RaftMessage::Vote(req) => {
                assert_eq!(req.vote, vote);
                assert_eq!(req.last_log_id, last_log_id);
            }
            other => panic!("expected Vote, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_decodes() {
        let msg = RaftMessage::AppendEntries(AppendEntriesRequest {
            vote: openraft::Vote::new(2, 1),
            prev_log_id: None,
            entries: vec![],
            leader_commit: None,
        });

        let bytes = serde_json::to_vec(&msg).unwrap();
        match serde_json::from_slice::<RaftMessage>(&bytes).unwrap() {
            RaftMessage::AppendEntries(req) => assert!(req.entries.is_empty()),
            other => panic!("expected AppendEntries, got {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_write() {
        let msg = RaftMessage::Forward(LeaderRequest::Write(KvCommand::put("foo", "bar")));
        let bytes = serde_json::to_vec(&msg).unwrap();
        match serde_json::from_slice::<RaftMessage>(&bytes).unwrap() {
            RaftMessage::Forward(LeaderRequest::Write(cmd)) => {
                assert_eq!(cmd, KvCommand::put("foo", "bar"))
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn test_node_status_is_leader() {
        let mut status = NodeStatus {
            id: 3,
            leader: 3,
            ..Default::default()
        };
        assert!(status.is_leader());

        status.leader = 1;
        assert!(!status.is_leader());

        status = NodeStatus::default();
        assert!(!status.is_leader());
    }
}
