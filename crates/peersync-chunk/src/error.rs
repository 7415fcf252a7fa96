//! Error types for the peersync-chunk subsystem

/// All errors that can occur while chunking, packing or transforming data
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed (corrupt or truncated compressed frame)
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch; data corrupted or tampered with
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// Encryption is configured but no master key was provided
    #[error("Missing encryption key: encryption is enabled but no master key was set")]
    MissingKey,
    /// A stored chunk does not hash to the checksum recorded next to it
    #[error("Chunk checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Checksum recorded in the multichunk
        expected: String,
        /// Checksum of the bytes actually read
        computed: String,
    },
    /// Malformed multichunk or transform frame
    #[error("Malformed data: {reason}")]
    Format {
        /// What was wrong with the input
        reason: String,
    },
    /// Invalid chunker, packer or transform configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChunkError {
    /// Shorthand for a [`ChunkError::Format`] error
    pub fn format(reason: impl Into<String>) -> Self {
        ChunkError::Format {
            reason: reason.into(),
        }
    }

    /// True if the error means stored data no longer matches what was written.
    /// Integrity failures are never retried.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ChunkError::DecryptionAuthFailed
                | ChunkError::ChecksumMismatch { .. }
                | ChunkError::DecompressionFailed(_)
        )
    }
}
