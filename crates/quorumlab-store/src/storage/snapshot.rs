//! Snapshot building and restoration for Raft.

use std::io::Cursor;
use std::path::PathBuf;

use anyerror::AnyError;
use openraft::storage::{RaftSnapshotBuilder, Snapshot};
use openraft::{LogId, StorageError, StorageIOError};
use serde::{Deserialize, Serialize};

use crate::storage::kv::KvTree;
use crate::types::{NodeId, SnapshotMeta, StoredMembership, TypeConfig};

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Builds snapshots of the key-value state.
///
/// A snapshot captures every key-value pair at a specific log position so a
/// lagging or newly added node can catch up without replaying the log.
pub struct SnapshotBuilder {
    kv: KvTree,
    snapshot_dir: PathBuf,
    last_applied: Option<LogId<NodeId>>,
    membership: StoredMembership,
}

impl SnapshotBuilder {
    /// Create a new snapshot builder.
    pub fn new(
        kv: KvTree,
        snapshot_dir: PathBuf,
        last_applied: Option<LogId<NodeId>>,
        membership: StoredMembership,
    ) -> Self {
        Self {
            kv,
            snapshot_dir,
            last_applied,
            membership,
        }
    }

    fn generate_snapshot_id(&self) -> String {
        let index = self.last_applied.map(|l| l.index).unwrap_or(0);
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("snap-{}-{}", index, timestamp)
    }

    fn build_snapshot_data(&self) -> Result<Vec<u8>, std::io::Error> {
        let entries = self
            .kv
            .entries()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        let snapshot = SnapshotData {
            version: SNAPSHOT_VERSION,
            last_log_index: self.last_applied.map(|l| l.index).unwrap_or(0),
            last_log_term: self.last_applied.map(|l| l.leader_id.term).unwrap_or(0),
            entries,
        };

        serde_json::to_vec(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    fn save_snapshot(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.snapshot_dir)?;

        let meta_bytes = serde_json::to_vec(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(self.snapshot_dir.join("current.meta"), meta_bytes)?;
        std::fs::write(self.snapshot_dir.join("current.snap"), data)?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "saved snapshot"
        );

        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let meta: SnapshotMeta = openraft::SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id: self.generate_snapshot_id(),
        };

        let snapshot_data = self
            .build_snapshot_data()
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;

        self.save_snapshot(&meta, &snapshot_data)
            .map_err(|e| StorageIOError::write_snapshot(None, AnyError::new(&e)))?;

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(snapshot_data)),
        })
    }
}

/// Serialized snapshot content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotData {
    version: u32,
    last_log_index: u64,
    last_log_term: u64,
    entries: Vec<(String, String)>,
}

/// Restores key-value state from a snapshot.
pub struct SnapshotRestorer {
    kv: KvTree,
}

impl SnapshotRestorer {
    /// Create a new snapshot restorer.
    pub fn new(kv: KvTree) -> Self {
        Self { kv }
    }

    /// Replace the key-value content with the snapshot's.
    ///
    /// Empty data leaves the tree untouched.
    pub fn restore(&self, data: &[u8]) -> Result<(), std::io::Error> {
        if data.is_empty() {
            return Ok(());
        }

        let snapshot: SnapshotData = serde_json::from_slice(data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported snapshot version {}", snapshot.version),
            ));
        }

        tracing::info!(
            index = snapshot.last_log_index,
            term = snapshot.last_log_term,
            keys = snapshot.entries.len(),
            "restoring snapshot"
        );

        self.kv
            .replace_all(&snapshot.entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}
