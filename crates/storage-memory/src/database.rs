//! In-memory database over `im::OrdMap`.

use im::OrdMap;
use std::sync::RwLock;
use verdant_storage::{BatchOp, Database, DbIterator, StorageError, WriteBatch};

/// In-memory storage for simulation and testing.
///
/// Uses `im::OrdMap` which provides:
/// - Deterministic ordering (like BTreeMap)
/// - O(1) clone via structural sharing
///
/// All methods take `&self`; the map lives behind an `RwLock` so the handle
/// can be shared between a tree and any snapshots derived from it.
pub struct MemoryDatabase {
    data: RwLock<OrdMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    /// Create a new empty in-memory database.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(OrdMap::new()),
        }
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Whether the database holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Structurally-shared copy of the current contents.
    ///
    /// O(1); useful for asserting on raw storage state in tests.
    pub fn snapshot(&self) -> OrdMap<Vec<u8>, Vec<u8>> {
        self.data.read().unwrap().clone()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.read().unwrap().contains_key(key))
    }

    fn iterate(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<DbIterator<'_>, StorageError> {
        let data = self.data.read().unwrap();

        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Ok(Box::new(std::iter::empty()));
            }
        }

        // Collect to a Vec so the iterator does not borrow the lock guard.
        // The snapshot is structurally shared, so this copies entries in the
        // range, not the whole map.
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = match (start, end) {
            (Some(s), Some(e)) => data
                .range(s.to_vec()..e.to_vec())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            (Some(s), None) => data
                .range(s.to_vec()..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            (None, Some(e)) => data
                .range(..e.to_vec())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            (None, None) => data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };

        if !ascending {
            items.reverse();
        }

        Ok(Box::new(items.into_iter().map(Ok)))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();
        for op in batch.into_ops() {
            match op {
                BatchOp::Set(key, value) => {
                    data.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
