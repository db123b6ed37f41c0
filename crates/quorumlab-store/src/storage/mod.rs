//! Storage implementations for Raft.
//!
//! - [`SledRaftLogStorage`] - Persistent log storage using sled
//! - [`KvStateMachine`] - State machine that applies key-value commands
//! - [`KvTree`] - The replicated key-value data and its content hash
//! - Snapshot support for catching up lagging or new nodes

pub mod kv;
pub mod log_storage;
pub mod snapshot;
pub mod state_machine;

pub use kv::KvTree;
pub use log_storage::SledRaftLogStorage;
pub use snapshot::{SnapshotBuilder, SnapshotRestorer};
pub use state_machine::KvStateMachine;
