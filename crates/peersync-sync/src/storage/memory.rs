//! In-memory remote repository, shared between clients in one process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::{RemoteFileMeta, RemoteStorage, StorageError};

/// [`RemoteStorage`] over a shared map. Clones see the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryStorage {
    /// An empty repository
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> Result<MutexGuard<'_, BTreeMap<String, Bytes>>, StorageError> {
        self.files
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// All file names
    pub fn names(&self) -> Vec<String> {
        self.files()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// File names starting with `prefix`
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .collect()
    }

    /// Raw content of a file
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.files().ok()?.get(name).cloned()
    }

    /// Store raw content directly, bypassing upload
    pub fn put(&self, name: &str, data: impl Into<Bytes>) {
        if let Ok(mut files) = self.files() {
            files.insert(name.to_string(), data.into());
        }
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, RemoteFileMeta>, StorageError> {
        Ok(self
            .files()?
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| {
                (
                    name.clone(),
                    RemoteFileMeta {
                        name: name.clone(),
                        size: data.len() as u64,
                    },
                )
            })
            .collect())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), StorageError> {
        let data = tokio::fs::read(local).await?;
        self.files()?.insert(remote.to_string(), Bytes::from(data));
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), StorageError> {
        let data = self
            .files()?
            .get(remote)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(remote.to_string()))?;
        tokio::fs::write(local, &data).await?;
        Ok(())
    }

    async fn move_file(&self, source: &str, target: &str) -> Result<(), StorageError> {
        let mut files = self.files()?;
        let data = files
            .remove(source)
            .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        files.insert(target.to_string(), data);
        Ok(())
    }

    async fn delete(&self, remote: &str) -> Result<bool, StorageError> {
        Ok(self.files()?.remove(remote).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_files() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.put("db-A-0000000001", b"x".to_vec());
        assert_eq!(b.list("db-").await.unwrap().len(), 1);
        b.move_file("db-A-0000000001", "temp-A-1").await.unwrap();
        assert_eq!(a.names(), vec!["temp-A-1".to_string()]);
        assert!(a.delete("temp-A-1").await.unwrap());
        assert!(!a.delete("temp-A-1").await.unwrap());
    }

    #[tokio::test]
    async fn move_of_missing_file_fails() {
        let storage = MemoryStorage::new();
        assert!(storage.move_file("a", "b").await.unwrap_err().is_not_found());
    }
}
