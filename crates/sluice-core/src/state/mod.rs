//! Partition-scoped state storage.
//!
//! Each assigned partition owns one [`StateStore`] instance, replayable from
//! a compacted Kafka change-log topic. Handlers read and mutate the store
//! through their event context; the [`changelog`] module ties mutations to
//! the change-log topic so they can travel in the same transaction as the
//! handler's output records.

use bytes::Bytes;
use rustc_hash::FxHashMap;

pub mod changelog;

pub use changelog::{ChangeLog, ChangeLogPartition};

/// Trait for partition-scoped state store implementations.
pub trait StateStore: Send + 'static {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Put a key-value pair.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key.
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Number of keys currently stored.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no keys.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush any pending writes.
    fn flush(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}

/// In-memory state store backed by an `FxHashMap`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: FxHashMap<Vec<u8>, Bytes>,
}

impl InMemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.data
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.data.remove(key);
        Ok(())
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error from a persistent backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored data failed an integrity check.
    #[error("state corruption: {0}")]
    Corruption(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let mut store = InMemoryStore::new();
        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Bytes::from("value1"));

        store.delete(b"key1").unwrap();
        assert!(store.get(b"key1").is_none());
    }

    #[test]
    fn test_len_and_empty() {
        let mut store = InMemoryStore::new();
        assert!(store.is_empty());
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let mut store = InMemoryStore::new();
        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"k").unwrap(), Bytes::from("v2"));
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let mut store = InMemoryStore::new();
        store.delete(b"missing").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_flush_default_noop() {
        let mut store = InMemoryStore::new();
        store.put(b"k", b"v").unwrap();
        store.flush().unwrap();
        assert_eq!(store.len(), 1);
    }
}
