//! The backing-store trait and its batch type.

use thiserror::Error;

/// Error type for backing-store operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Backend(String),
}

/// Iterator over `(key, value)` pairs in key order.
///
/// Entries surface lazily, so each step can fail with a backend error.
pub type DbIterator<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StorageError>> + 'a>;

/// A single staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set `key` to `value`.
    Set(Vec<u8>, Vec<u8>),
    /// Delete `key` if present.
    Delete(Vec<u8>),
}

/// An ordered list of writes applied atomically by [`Database::write`].
///
/// Later operations on the same key win, matching the semantics of every
/// mainstream write-batch implementation.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a set operation.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Set(key, value));
    }

    /// Stage a delete operation.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch has no staged operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding its operations in staging order.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Borrow the staged operations.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// An ordered key/value store.
///
/// All methods take `&self`; implementations use interior mutability so the
/// handle can be shared between the tree, its node database, and read-only
/// snapshots.
pub trait Database: Send + Sync {
    /// Point read. Returns `None` if the key is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Existence check without copying the value out.
    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterate `[start, end)` in key order.
    ///
    /// `None` bounds are unbounded on that side. When `ascending` is false
    /// the same range is yielded in reverse key order. An empty or inverted
    /// range yields nothing. The iterator observes the database as of this
    /// call; writes applied while it is live need not surface through it.
    fn iterate(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<DbIterator<'_>, StorageError>;

    /// Apply a batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = WriteBatch::new();
        batch.set(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"a".to_vec());
        batch.set(b"b".to_vec(), b"2".to_vec());

        let ops = batch.into_ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], BatchOp::Set(b"a".to_vec(), b"1".to_vec()));
        assert_eq!(ops[1], BatchOp::Delete(b"a".to_vec()));
        assert_eq!(ops[2], BatchOp::Set(b"b".to_vec(), b"2".to_vec()));
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
