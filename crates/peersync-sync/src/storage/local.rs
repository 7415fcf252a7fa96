//! Remote repository kept in a local (or mounted) directory.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{RemoteFileMeta, RemoteStorage, StorageError};

/// In-flight uploads are written under this prefix and renamed into place,
/// so a listing never shows a partially written file.
const PARTIAL_PREFIX: &str = ".partial-";

/// Directory-backed [`RemoteStorage`].
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Use `root` as the repository, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Repository directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StorageError::PermissionDenied(format!(
                "invalid remote name '{}'",
                name
            )));
        }
        Ok(self.root.join(name))
    }
}

fn map_not_found(e: io::Error, name: &str) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl RemoteStorage for LocalStorage {
    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, RemoteFileMeta>, StorageError> {
        let mut out = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                out.insert(
                    name.clone(),
                    RemoteFileMeta {
                        name,
                        size: meta.len(),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), StorageError> {
        let target = self.path(remote)?;
        let partial = self
            .root
            .join(format!("{}{}", PARTIAL_PREFIX, Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::copy(local, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::rename(&partial, &target).await?;
        debug!(remote, "uploaded");
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), StorageError> {
        let source = self.path(remote)?;
        tokio::fs::copy(&source, local)
            .await
            .map_err(|e| map_not_found(e, remote))?;
        Ok(())
    }

    async fn move_file(&self, source: &str, target: &str) -> Result<(), StorageError> {
        let from = self.path(source)?;
        let to = self.path(target)?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| map_not_found(e, source))
    }

    async fn delete(&self, remote: &str) -> Result<bool, StorageError> {
        let path = self.path(remote)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
