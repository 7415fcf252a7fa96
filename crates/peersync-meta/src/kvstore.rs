//! Key-value index behind the local database.
//!
//! The index is derived state: it is rebuilt from `database.log` on open, so the
//! in-memory implementation is the only one needed.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for the metadata index.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;

    /// Remove every key.
    fn clear(&self) -> Result<(), MetaError>;
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Key,
        /// The value to store.
        value: Value,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Key,
    },
}

impl BatchOp {
    /// Shorthand for [`BatchOp::Put`]
    pub fn put(key: impl Into<Key>, value: Value) -> Self {
        BatchOp::Put {
            key: key.into(),
            value,
        }
    }

    /// Shorthand for [`BatchOp::Delete`]
    pub fn delete(key: impl Into<Key>) -> Self {
        BatchOp::Delete { key: key.into() }
    }
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
#[derive(Default, Clone)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Key, Value>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    pub fn len(&self) -> Result<usize, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.len())
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> Result<bool, MetaError> {
        Ok(self.len()? == 0)
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let data = Arc::clone(&self.data);
        let _ = std::thread::spawn(move || {
            let _guard = data.write().unwrap();
            panic!("index writer died");
        })
        .join();
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data
            .range::<Vec<u8>, _>(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_put_and_delete() {
        let store = MemoryKvStore::new();
        store
            .write_batch(vec![
                BatchOp::put(b"v/1".to_vec(), b"a".to_vec()),
                BatchOp::put(b"v/2".to_vec(), b"b".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.get(b"v/1").unwrap(), Some(b"a".to_vec()));
        store.write_batch(vec![BatchOp::delete(b"v/1".to_vec())]).unwrap();
        assert!(!store.contains_key(b"v/1").unwrap());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn scan_prefix_is_sorted_and_bounded() {
        let store = MemoryKvStore::new();
        store
            .write_batch(vec![
                BatchOp::put(b"p/b".to_vec(), b"2".to_vec()),
                BatchOp::put(b"p/a".to_vec(), b"1".to_vec()),
                BatchOp::put(b"q/x".to_vec(), b"3".to_vec()),
            ])
            .unwrap();
        let result = store.scan_prefix(b"p/").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, b"p/a");
        assert_eq!(result[1].0, b"p/b");
    }

    #[test]
    fn clear_removes_everything() {
        let store = MemoryKvStore::new();
        store.write_batch(vec![BatchOp::put(b"k".to_vec(), vec![1])]).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
    }
}
