//! Remote storage capability.
//!
//! The sync core talks to the shared repository only through
//! [`RemoteStorage`]: flat file names, whole-file upload and download, move
//! and delete. Concrete network backends live outside this crate; a
//! local-directory and an in-memory backend are provided, plus a
//! fault-injecting wrapper for tests.

pub mod local;
pub mod memory;
pub mod unreliable;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use unreliable::{Fault, StorageOp, UnreliableStorage};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The remote file does not exist.
    #[error("remote file not found: {0}")]
    NotFound(String),

    /// The backend could not be reached or the connection dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The operation did not finish in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The backend refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Local or remote I/O failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// True for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Connection(_) | StorageError::Timeout(_) => true,
            StorageError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
            StorageError::NotFound(_) | StorageError::PermissionDenied(_) => false,
        }
    }

    /// True if the remote file does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Listing entry for one remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileMeta {
    /// Remote file name
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// The narrow capability the sync core needs from a remote repository.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Files whose name starts with `prefix`, keyed by name.
    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, RemoteFileMeta>, StorageError>;

    /// Upload the local file at `local` as `remote`, replacing any existing file.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), StorageError>;

    /// Download `remote` into the local file at `local`.
    async fn download(&self, remote: &str, local: &Path) -> Result<(), StorageError>;

    /// Rename `source` to `target`.
    async fn move_file(&self, source: &str, target: &str) -> Result<(), StorageError>;

    /// Delete `remote`. Returns false if it did not exist.
    async fn delete(&self, remote: &str) -> Result<bool, StorageError>;
}

/// Local directory for files on their way to or from remote storage.
#[derive(Debug, Clone)]
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    /// Use (and create) `dir` for scratch files
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Scratch directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh, unused path inside the scratch directory
    pub fn file(&self, hint: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}", hint, Uuid::new_v4().simple()))
    }

    /// Write `bytes` to a fresh scratch file and return its path
    pub async fn write(&self, hint: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.file(hint);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Download `remote` through a scratch file and return its bytes
    pub async fn download(
        &self,
        storage: &dyn RemoteStorage,
        remote: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.file("download");
        let result = storage.download(remote, &path).await;
        let bytes = match result {
            Ok(()) => tokio::fs::read(&path).await.map_err(StorageError::from),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&path).await;
        bytes
    }
}
