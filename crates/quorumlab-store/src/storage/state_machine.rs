//! Raft state machine over the key-value tree.

use std::io::Cursor;
use std::path::PathBuf;

use anyerror::AnyError;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{Entry, EntryPayload, LogId, OptionalSend, StorageError, StorageIOError};
use parking_lot::RwLock;
use sled::{Db, Tree};

use crate::error::StoreError;
use crate::storage::kv::KvTree;
use crate::storage::snapshot::{SnapshotBuilder, SnapshotRestorer};
use crate::types::{
    KvCommand, KvResponse, Membership, NodeId, SnapshotMeta, StoredMembership, TypeConfig,
};

/// Tree name for state machine metadata.
const SM_STATE_TREE: &str = "raft_sm_state";

const KEY_LAST_APPLIED: &[u8] = b"last_applied";
const KEY_MEMBERSHIP: &[u8] = b"membership";

/// Raft state machine that applies committed [`KvCommand`]s.
///
/// Tracks the last applied log ID and membership alongside the data so both
/// survive a restart of the node.
pub struct KvStateMachine {
    kv: KvTree,
    state_tree: Tree,
    last_applied: RwLock<Option<LogId<NodeId>>>,
    membership: RwLock<StoredMembership>,
    snapshot_dir: PathBuf,
}

impl KvStateMachine {
    /// Create a new state machine backed by `db`.
    pub fn new(db: &Db, snapshot_dir: PathBuf) -> Result<Self, StoreError> {
        let kv = KvTree::open(db)?;
        let state_tree = db.open_tree(SM_STATE_TREE)?;

        let last_applied = Self::load_last_applied(&state_tree)?;
        let membership = Self::load_membership(&state_tree)?;

        std::fs::create_dir_all(&snapshot_dir).map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(Self {
            kv,
            state_tree,
            last_applied: RwLock::new(last_applied),
            membership: RwLock::new(membership),
            snapshot_dir,
        })
    }

    fn load_last_applied(state_tree: &Tree) -> Result<Option<LogId<NodeId>>, StoreError> {
        match state_tree.get(KEY_LAST_APPLIED)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_membership(state_tree: &Tree) -> Result<StoredMembership, StoreError> {
        match state_tree.get(KEY_MEMBERSHIP)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(StoredMembership::new(None, Membership::new(vec![], None))),
        }
    }

    fn persist_state(&self) -> Result<(), StoreError> {
        if let Some(log_id) = *self.last_applied.read() {
            self.state_tree
                .insert(KEY_LAST_APPLIED, serde_json::to_vec(&log_id)?)?;
        }

        let membership = self.membership.read().clone();
        self.state_tree
            .insert(KEY_MEMBERSHIP, serde_json::to_vec(&membership)?)?;

        self.state_tree.flush()?;
        Ok(())
    }

    fn apply_command(&self, command: &KvCommand) -> Result<KvResponse, StoreError> {
        match command {
            KvCommand::Put { key, value } => Ok(KvResponse::Put {
                previous: self.kv.put(key, value)?,
            }),
            KvCommand::Delete { key } => Ok(KvResponse::Deleted {
                existed: self.kv.delete(key)?,
            }),
            KvCommand::Noop => Ok(KvResponse::Noop),
        }
    }

    /// The key-value tree this state machine writes to.
    pub fn kv(&self) -> &KvTree {
        &self.kv
    }

    /// Get the current last applied log ID.
    pub fn last_applied(&self) -> Option<LogId<NodeId>> {
        *self.last_applied.read()
    }

    /// Get the current membership.
    pub fn membership(&self) -> StoredMembership {
        self.membership.read().clone()
    }

    fn write_current_snapshot(&self, meta: &SnapshotMeta, data: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(self.snapshot_dir.join("current.meta"), meta_bytes)?;
        std::fs::write(self.snapshot_dir.join("current.snap"), data)
    }
}

impl RaftStateMachine<TypeConfig> for KvStateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership), StorageError<NodeId>> {
        Ok((*self.last_applied.read(), self.membership.read().clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<KvResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            *self.last_applied.write() = Some(entry.log_id);

            let response = match entry.payload {
                EntryPayload::Blank => KvResponse::Noop,
                EntryPayload::Normal(command) => self
                    .apply_command(&command)
                    .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?,
                EntryPayload::Membership(membership) => {
                    *self.membership.write() =
                        StoredMembership::new(Some(entry.log_id), membership);
                    KvResponse::Noop
                }
            };

            responses.push(response);
        }

        self.persist_state()
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder::new(
            self.kv.clone(),
            self.snapshot_dir.clone(),
            *self.last_applied.read(),
            self.membership.read().clone(),
        )
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        SnapshotRestorer::new(self.kv.clone())
            .restore(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), AnyError::new(&e)))?;

        self.write_current_snapshot(meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), AnyError::new(&e)))?;

        *self.last_applied.write() = meta.last_log_id;
        *self.membership.write() = meta.last_membership.clone();

        self.persist_state()
            .map_err(|e| StorageIOError::write_state_machine(AnyError::new(&e)))?;

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let snapshot_path = self.snapshot_dir.join("current.snap");
        let meta_path = self.snapshot_dir.join("current.meta");
        if !snapshot_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let meta_bytes = std::fs::read(&meta_path)
            .map_err(|e| StorageIOError::read_snapshot(None, AnyError::new(&e)))?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| StorageIOError::read_snapshot(None, AnyError::new(&e)))?;

        let data = std::fs::read(&snapshot_path)
            .map_err(|e| StorageIOError::read_snapshot(None, AnyError::new(&e)))?;

        Ok(Some(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::storage::RaftSnapshotBuilder;
    use std::collections::BTreeSet;

    fn entry(index: u64, payload: EntryPayload<TypeConfig>) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), index),
            payload,
        }
    }

    fn temp_db() -> Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[tokio::test]
    async fn test_apply_blank() {
        let db = temp_db();
        let snapshot_dir = tempfile::tempdir().unwrap();
        let mut sm = KvStateMachine::new(&db, snapshot_dir.path().to_path_buf()).unwrap();

        let responses = sm.apply(vec![entry(1, EntryPayload::Blank)]).await.unwrap();
        assert_eq!(responses, vec![KvResponse::Noop]);

        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_apply_put_and_delete() {
        let db = temp_db();
        let snapshot_dir = tempfile::tempdir().unwrap();
        let mut sm = KvStateMachine::new(&db, snapshot_dir.path().to_path_buf()).unwrap();

        let responses = sm
            .apply(vec![
                entry(1, EntryPayload::Normal(KvCommand::put("foo", "bar"))),
                entry(2, EntryPayload::Normal(KvCommand::put("foo", "baz"))),
                entry(3, EntryPayload::Normal(KvCommand::delete("foo"))),
                entry(4, EntryPayload::Normal(KvCommand::delete("foo"))),
            ])
            .await
            .unwrap();

        assert_eq!(
            responses,
            vec![
                KvResponse::Put { previous: None },
                KvResponse::Put {
                    previous: Some("bar".to_string())
                },
                KvResponse::Deleted { existed: true },
                KvResponse::Deleted { existed: false },
            ]
        );
        assert_eq!(sm.kv().get("foo").unwrap(), None);
        assert_eq!(sm.last_applied().unwrap().index, 4);
    }

    #[tokio::test]
    async fn test_apply_membership() {
        let db = temp_db();
        let snapshot_dir = tempfile::tempdir().unwrap();
        let mut sm = KvStateMachine::new(&db, snapshot_dir.path().to_path_buf()).unwrap();

        let membership = Membership::new(vec![BTreeSet::from([1, 2, 3])], None);
        sm.apply(vec![entry(1, EntryPayload::Membership(membership.clone()))])
            .await
            .unwrap();

        let (_, stored) = sm.applied_state().await.unwrap();
        assert_eq!(*stored.membership(), membership);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_dir = tempfile::tempdir().unwrap();

        {
            let db = sled::open(dir.path()).unwrap();
            let mut sm = KvStateMachine::new(&db, snapshot_dir.path().to_path_buf()).unwrap();
            sm.apply(vec![entry(5, EntryPayload::Normal(KvCommand::put("foo", "bar")))])
                .await
                .unwrap();
            db.flush().unwrap();
        }

        let db = sled::open(dir.path()).unwrap();
        let mut sm = KvStateMachine::new(&db, snapshot_dir.path().to_path_buf()).unwrap();
        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 5);
        assert_eq!(sm.kv().get("foo").unwrap(), Some("bar".to_string()));
    }

    #[tokio::test]
    async fn test_install_snapshot_from_peer() {
        let leader_db = temp_db();
        let leader_dir = tempfile::tempdir().unwrap();
        let mut leader = KvStateMachine::new(&leader_db, leader_dir.path().to_path_buf()).unwrap();
        leader
            .apply(vec![
                entry(1, EntryPayload::Normal(KvCommand::put("a", "1"))),
                entry(2, EntryPayload::Normal(KvCommand::put("b", "2"))),
            ])
            .await
            .unwrap();

        let mut builder = leader.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();

        let follower_db = temp_db();
        let follower_dir = tempfile::tempdir().unwrap();
        let mut follower =
            KvStateMachine::new(&follower_db, follower_dir.path().to_path_buf()).unwrap();
        follower
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(follower.last_applied().unwrap().index, 2);
        assert_eq!(
            follower.kv().hash().unwrap(),
            leader.kv().hash().unwrap()
        );
        assert!(follower.get_current_snapshot().await.unwrap().is_some());
    }
}
