//! Content fingerprinting: BLAKE3 checksums for chunks, files and multichunk ids

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ChunkError;

/// Length in bytes of every checksum and identifier in this crate.
pub const CHECKSUM_LEN: usize = 32;

fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn from_hex(s: &str) -> Result<[u8; CHECKSUM_LEN], ChunkError> {
    let mut out = [0u8; CHECKSUM_LEN];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| ChunkError::format(format!("invalid checksum hex: {}", e)))?;
    Ok(out)
}

macro_rules! checksum_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; CHECKSUM_LEN]);

        impl $name {
            /// Return the value as a lowercase hex string
            pub fn to_hex(&self) -> String {
                to_hex(&self.0)
            }

            /// Parse a 64-character lowercase or uppercase hex string
            pub fn from_hex(s: &str) -> Result<Self, ChunkError> {
                from_hex(s).map($name)
            }

            /// Return the raw bytes
            pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
                &self.0
            }

            /// Build from a slice, which must be exactly 32 bytes long
            pub fn from_slice(bytes: &[u8]) -> Result<Self, ChunkError> {
                let arr: [u8; CHECKSUM_LEN] = bytes.try_into().map_err(|_| {
                    ChunkError::format(format!(
                        "expected {} checksum bytes, got {}",
                        CHECKSUM_LEN,
                        bytes.len()
                    ))
                })?;
                Ok($name(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..12])
            }
        }
    };
}

checksum_type!(
    /// A 32-byte BLAKE3 hash identifying a chunk's content. Used as the CAS key.
    ChunkChecksum
);

checksum_type!(
    /// A 32-byte BLAKE3 hash over a whole file's content.
    FileChecksum
);

checksum_type!(
    /// Identifier of a multichunk container.
    MultiChunkId
);

impl MultiChunkId {
    /// Generate a random multichunk id
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; CHECKSUM_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        MultiChunkId(bytes)
    }
}

/// Compute the BLAKE3 checksum of a chunk's content
pub fn chunk_checksum(data: &[u8]) -> ChunkChecksum {
    ChunkChecksum(*blake3::hash(data).as_bytes())
}

/// Compute the BLAKE3 checksum of an in-memory file
pub fn file_checksum(data: &[u8]) -> FileChecksum {
    FileChecksum(*blake3::hash(data).as_bytes())
}

/// Compute the BLAKE3 checksum of a file by streaming it from a reader
pub fn file_checksum_reader<R: std::io::Read>(mut reader: R) -> Result<FileChecksum, ChunkError> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(FileChecksum(*hasher.finalize().as_bytes()))
}
