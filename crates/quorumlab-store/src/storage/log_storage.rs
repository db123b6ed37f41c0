//! Raft log storage implementation using sled.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{LogFlushed, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, LogState, OptionalSend, StorageError, StorageIOError, Vote};
use parking_lot::RwLock;
use sled::{Db, Tree};

use crate::error::StoreError;
use crate::types::{NodeId, TypeConfig};

/// Tree names for Raft storage in sled.
const RAFT_LOG_TREE: &str = "raft_log";
const RAFT_VOTE_TREE: &str = "raft_vote";
const RAFT_STATE_TREE: &str = "raft_state";

/// Keys in the state tree.
const KEY_LAST_PURGED: &[u8] = b"last_purged_log_id";

/// Raft log storage backed by sled.
///
/// Log entries live in `raft_log` keyed by big-endian index, the vote in
/// `raft_vote`, and the last purged log ID in `raft_state`. The trees share
/// the node's single database with the state machine.
#[derive(Clone)]
pub struct SledRaftLogStorage {
    log_tree: Tree,
    vote_tree: Tree,
    state_tree: Tree,
    /// Shared with log readers handed out to openraft.
    last_purged: Arc<RwLock<Option<LogId<NodeId>>>>,
}

impl SledRaftLogStorage {
    /// Open or create the Raft log trees in the given sled database.
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        let log_tree = db.open_tree(RAFT_LOG_TREE)?;
        let vote_tree = db.open_tree(RAFT_VOTE_TREE)?;
        let state_tree = db.open_tree(RAFT_STATE_TREE)?;

        let last_purged = Self::load_last_purged(&state_tree)?;

        Ok(Self {
            log_tree,
            vote_tree,
            state_tree,
            last_purged: Arc::new(RwLock::new(last_purged)),
        })
    }

    /// Encode log index as key (big-endian for lexicographic ordering).
    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    /// Load last purged log ID from state tree.
    fn load_last_purged(state_tree: &Tree) -> Result<Option<LogId<NodeId>>, StoreError> {
        match state_tree.get(KEY_LAST_PURGED)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Save last purged log ID to state tree.
    fn save_last_purged(&self, log_id: LogId<NodeId>) -> Result<(), StoreError> {
        self.state_tree
            .insert(KEY_LAST_PURGED, serde_json::to_vec(&log_id)?)?;
        self.state_tree.flush()?;
        *self.last_purged.write() = Some(log_id);
        Ok(())
    }

    /// The last log ID, falling back to the last purged one when the log is empty.
    fn get_last_log_id(&self) -> Result<Option<LogId<NodeId>>, StoreError> {
        match self.log_tree.last()? {
            Some((_, value)) => Ok(Some(Self::deserialize_entry(&value)?.log_id)),
            None => Ok(*self.last_purged.read()),
        }
    }

    fn serialize_entry(entry: &Entry<TypeConfig>) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(entry)?)
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<Entry<TypeConfig>, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn remove_keys(&self, keys: Vec<sled::IVec>) -> Result<(), StorageError<NodeId>> {
        for key in keys {
            self.log_tree
                .remove(key)
                .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        }
        self.log_tree
            .flush()
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for SledRaftLogStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        use std::ops::Bound;

        let start = match range.start_bound() {
            Bound::Included(&i) => Self::log_key(i),
            Bound::Excluded(&i) => Self::log_key(i.saturating_add(1)),
            Bound::Unbounded => Self::log_key(0),
        };

        let end = match range.end_bound() {
            Bound::Included(&i) => Some(Self::log_key(i.saturating_add(1))),
            Bound::Excluded(&i) => Some(Self::log_key(i)),
            Bound::Unbounded => None,
        };

        let iter = if let Some(end_key) = end {
            self.log_tree.range(start..end_key)
        } else {
            self.log_tree.range(start..)
        };

        let mut entries = Vec::new();
        for result in iter {
            let (_, value) = result.map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            let entry =
                Self::deserialize_entry(&value).map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for SledRaftLogStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = *self.last_purged.read();
        let last_log_id = self
            .get_last_log_id()
            .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .insert(b"vote", bytes)
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .flush()
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        match self
            .vote_tree
            .get(b"vote")
            .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?
        {
            Some(bytes) => {
                let vote: Vote<NodeId> =
                    serde_json::from_slice(&bytes).map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?;
                Ok(Some(vote))
            }
            None => Ok(None),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        for entry in entries {
            let key = Self::log_key(entry.log_id.index);
            let value =
                Self::serialize_entry(&entry).map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
            self.log_tree
                .insert(key, value)
                .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        }

        self.log_tree
            .flush()
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let keys: Vec<_> = self
            .log_tree
            .range(Self::log_key(log_id.index)..)
            .filter_map(|r| r.ok().map(|(k, _)| k))
            .collect();

        self.remove_keys(keys)
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let keys: Vec<_> = self
            .log_tree
            .range(..Self::log_key(log_id.index.saturating_add(1)))
            .filter_map(|r| r.ok().map(|(k, _)| k))
            .collect();

        self.remove_keys(keys)?;

        self.save_last_purged(log_id)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        Ok(())
    }
}
