//! LZ4 and Zstd compression for multichunks and metadata files

use crate::error::ChunkError;
use serde::{Deserialize, Serialize};

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 block format with prepended size
    #[default]
    Lz4,
    /// Zstandard, higher ratio for slow links
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl CompressionAlgorithm {
    pub(crate) fn code(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd { .. } => 2,
        }
    }

    /// Reverse of `code`. The Zstd level is irrelevant for decoding.
    pub(crate) fn from_code(code: u8) -> Result<Self, ChunkError> {
        match code {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            2 => Ok(CompressionAlgorithm::Zstd { level: 3 }),
            other => Err(ChunkError::format(format!(
                "unknown compression algorithm code {}",
                other
            ))),
        }
    }
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ChunkError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ChunkError::CompressionFailed(e.to_string()))
        }
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ChunkError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ChunkError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| ChunkError::DecompressionFailed(e.to_string()))
        }
    }
}
