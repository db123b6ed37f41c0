//! The replicated key-value tree.

use sled::Tree;

use crate::error::Result;

/// Tree name for user key-value data.
pub const KV_TREE: &str = "kv";

/// A handle to the key-value data of one node.
///
/// Cloning is cheap; all clones share the same sled tree.
#[derive(Clone)]
pub struct KvTree {
    tree: Tree,
}

impl KvTree {
    /// Open the key-value tree of a database.
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(KV_TREE)?,
        })
    }

    /// Get the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
        let previous = self.tree.insert(key.as_bytes(), value.as_bytes())?;
        Ok(previous.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Remove `key`, returning whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.tree.remove(key.as_bytes())?.is_some())
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// All key-value pairs in key order.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::with_capacity(self.tree.len());
        for item in self.tree.iter() {
            let (k, v) = item?;
            entries.push((
                String::from_utf8_lossy(&k).into_owned(),
                String::from_utf8_lossy(&v).into_owned(),
            ));
        }
        Ok(entries)
    }

    /// Replace the whole content with `entries`.
    pub fn replace_all(&self, entries: &[(String, String)]) -> Result<()> {
        self.tree.clear()?;
        let mut batch = sled::Batch::default();
        for (k, v) in entries {
            batch.insert(k.as_bytes(), v.as_bytes());
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Content hash over all key-value pairs.
    ///
    /// Two nodes that applied the same writes report the same hash; raft
    /// bookkeeping does not contribute.
    pub fn hash(&self) -> Result<u32> {
        let mut hasher = blake3::Hasher::new();
        for item in self.tree.iter() {
            let (k, v) = item?;
            hasher.update(&(k.len() as u64).to_le_bytes());
            hasher.update(&k);
            hasher.update(&(v.len() as u64).to_le_bytes());
            hasher.update(&v);
        }
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
