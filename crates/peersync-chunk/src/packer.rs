//! Packs new chunks into multichunks, sealing each one once it reaches capacity.

use crate::chunker::Chunk;
use crate::error::ChunkError;
use crate::fingerprint::{ChunkChecksum, MultiChunkId, CHECKSUM_LEN};
use crate::index::ChunkLocation;
use crate::multichunk::{MultiChunkWriter, DEFAULT_MULTICHUNK_CAPACITY};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bytes of the multichunk header before the first record
const HEADER_LEN: u32 = 1 + CHECKSUM_LEN as u32 + 1;
/// Bytes of a record before its content
const RECORD_OVERHEAD: u32 = CHECKSUM_LEN as u32 + 2;

/// Where one chunk sits inside a sealed multichunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEntry {
    /// Checksum of the chunk content
    pub checksum: ChunkChecksum,
    /// Byte offset of the record within the untransformed multichunk
    pub offset: u32,
    /// Size of the chunk content
    pub size: u32,
}

/// A closed multichunk ready for the transform chain and upload.
#[derive(Debug, Clone)]
pub struct SealedMultiChunk {
    /// Random container id
    pub id: MultiChunkId,
    /// Records in write order
    pub entries: Vec<PackedEntry>,
    /// Serialized container (header and records)
    pub bytes: Vec<u8>,
}

impl SealedMultiChunk {
    /// Number of chunks in this multichunk
    pub fn total_chunks(&self) -> usize {
        self.entries.len()
    }

    /// Sum of chunk content sizes
    pub fn content_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size as u64).sum()
    }
}

/// Configuration for the multichunk packer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Content bytes after which a multichunk is sealed
    pub capacity: usize,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MULTICHUNK_CAPACITY,
        }
    }
}

struct OpenMultiChunk {
    writer: MultiChunkWriter<Vec<u8>>,
    entries: Vec<PackedEntry>,
    next_offset: u32,
}

/// Packs chunks into multichunks of bounded size.
pub struct MultiChunkPacker {
    config: PackerConfig,
    current: Option<OpenMultiChunk>,
}

impl Default for MultiChunkPacker {
    fn default() -> Self {
        Self::new(PackerConfig::default())
    }
}

impl MultiChunkPacker {
    /// Create a new packer with the given configuration.
    pub fn new(config: PackerConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Add a chunk to the open multichunk, opening one if needed.
    /// Returns where the chunk landed and, if it filled the container, the sealed multichunk.
    pub fn add_chunk(
        &mut self,
        chunk: &Chunk,
    ) -> Result<(ChunkLocation, Option<SealedMultiChunk>), ChunkError> {
        let mut open = match self.current.take() {
            Some(open) => open,
            None => OpenMultiChunk {
                writer: MultiChunkWriter::new(
                    MultiChunkId::random(),
                    Vec::new(),
                    self.config.capacity,
                )?,
                entries: Vec::new(),
                next_offset: HEADER_LEN,
            },
        };
        open.writer.write(chunk)?;
        let entry = PackedEntry {
            checksum: chunk.checksum,
            offset: open.next_offset,
            size: chunk.size() as u32,
        };
        open.next_offset += RECORD_OVERHEAD + entry.size;
        open.entries.push(entry);
        let location = ChunkLocation {
            multichunk_id: open.writer.id(),
            offset: entry.offset,
        };

        if open.writer.is_full() {
            let sealed = Self::seal(open)?;
            debug!(multichunk = %sealed.id, chunks = sealed.total_chunks(), "multichunk sealed (full)");
            return Ok((location, Some(sealed)));
        }
        self.current = Some(open);
        Ok((location, None))
    }

    /// Seal the open multichunk, if any.
    pub fn flush(&mut self) -> Result<Option<SealedMultiChunk>, ChunkError> {
        match self.current.take() {
            Some(open) if !open.entries.is_empty() => {
                let sealed = Self::seal(open)?;
                debug!(multichunk = %sealed.id, chunks = sealed.total_chunks(), "multichunk sealed (flush)");
                Ok(Some(sealed))
            }
            _ => Ok(None),
        }
    }

    /// True if chunks are waiting in an unsealed multichunk
    pub fn has_pending(&self) -> bool {
        self.current.is_some()
    }

    fn seal(open: OpenMultiChunk) -> Result<SealedMultiChunk, ChunkError> {
        let id = open.writer.id();
        let bytes = open.writer.close()?;
        Ok(SealedMultiChunk {
            id,
            entries: open.entries,
            bytes,
        })
    }
}
