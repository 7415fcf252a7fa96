//! Error types for the sync subsystem.

use peersync_chunk::ChunkError;
use peersync_meta::MetaError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors that end a sync cycle or one of its phases.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote storage call failed, after retries where retries apply.
    #[error("transport error: {0}")]
    Transport(#[from] StorageError),

    /// Stored bytes failed a checksum or authentication check.
    #[error("integrity check failed for {artifact}: {reason}")]
    Integrity {
        /// Remote or local artifact that failed
        artifact: String,
        /// What the check reported
        reason: String,
    },

    /// A multichunk, database file or manifest could not be decoded.
    #[error("malformed {artifact}: {reason}")]
    Format {
        /// Artifact that failed to decode
        artifact: String,
        /// Decoder message
        reason: String,
    },

    /// Remote histories are inconsistent, so no winner can be chosen safely.
    #[error("cannot resolve winning branch: {reason}")]
    ConflictResolution {
        /// What made the inputs unresolvable
        reason: String,
    },

    /// A remote transaction could not be committed and was rolled back.
    #[error("transaction {transaction} failed: {reason}")]
    Transaction {
        /// Manifest name of the transaction
        transaction: String,
        /// Underlying failure
        reason: String,
    },

    /// Another client has a pending transaction that deletes remote files.
    #[error("blocked by pending transactions of {clients:?}")]
    BlockingTransactions {
        /// Clients owning the blocking manifests
        clients: Vec<String>,
    },

    /// The cycle was cancelled between phases.
    #[error("sync cycle cancelled")]
    Cancelled,

    /// A cycle is already running for this folder.
    #[error("a sync cycle is already running")]
    Busy,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Chunking or transform failure that is not tied to a remote artifact.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// Local database failure.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for the sync subsystem.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// True if running the same cycle again may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.is_retryable(),
            SyncError::Transaction { .. } | SyncError::BlockingTransactions { .. } => true,
            SyncError::Busy => true,
            _ => false,
        }
    }

    /// True for tamper or corruption failures.
    pub fn is_integrity(&self) -> bool {
        match self {
            SyncError::Integrity { .. } => true,
            SyncError::Chunk(e) => e.is_integrity(),
            SyncError::Meta(e) => e.is_integrity(),
            _ => false,
        }
    }

    /// Classify a decode failure of a named artifact.
    pub fn decode(artifact: impl Into<String>, err: impl Into<DecodeFailure>) -> Self {
        let artifact = artifact.into();
        match err.into() {
            DecodeFailure { integrity: true, reason } => SyncError::Integrity { artifact, reason },
            DecodeFailure { reason, .. } => SyncError::Format { artifact, reason },
        }
    }
}

/// A decode error reduced to its classification.
#[derive(Debug)]
pub struct DecodeFailure {
    integrity: bool,
    reason: String,
}

impl From<ChunkError> for DecodeFailure {
    fn from(e: ChunkError) -> Self {
        Self {
            integrity: e.is_integrity(),
            reason: e.to_string(),
        }
    }
}

impl From<MetaError> for DecodeFailure {
    fn from(e: MetaError) -> Self {
        Self {
            integrity: e.is_integrity(),
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for DecodeFailure {
    fn from(e: serde_json::Error) -> Self {
        Self {
            integrity: false,
            reason: e.to_string(),
        }
    }
}
