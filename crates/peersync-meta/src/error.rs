//! Error types for the metadata subsystem.

use thiserror::Error;

/// Errors produced by the metadata model and the local database.
#[derive(Debug, Error)]
pub enum MetaError {
    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// A persisted record or remote file could not be decoded.
    #[error("malformed {what}: {reason}")]
    Format {
        /// What was being decoded
        what: &'static str,
        /// Why decoding failed
        reason: String,
    },

    /// A database version with this header is already present.
    #[error("database version {0} already exists")]
    DuplicateVersion(String),

    /// A remote file name does not follow the naming convention.
    #[error("invalid remote file name '{0}'")]
    InvalidRemoteName(String),

    /// A transformed database file failed its integrity check.
    #[error(transparent)]
    Chunk(#[from] peersync_chunk::ChunkError),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    pub(crate) fn format(what: &'static str, reason: impl ToString) -> Self {
        MetaError::Format {
            what,
            reason: reason.to_string(),
        }
    }

    /// True if the error means stored bytes were tampered with or corrupted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, MetaError::Chunk(e) if e.is_integrity())
    }
}
