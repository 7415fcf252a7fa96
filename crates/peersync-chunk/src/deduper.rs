//! Deduplicating indexer: chunk files, skip known chunks, pack the rest.

use crate::chunker::Chunker;
use crate::error::ChunkError;
use crate::fingerprint::{ChunkChecksum, FileChecksum};
use crate::index::{ChunkIndex, ChunkLocation, ChunkLookup};
use crate::packer::{MultiChunkPacker, PackerConfig, SealedMultiChunk};
use std::io::Read;
use tracing::{debug, instrument};

/// Result of deduplicating one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    /// Checksum over the whole file content
    pub checksum: FileChecksum,
    /// File size in bytes
    pub size: u64,
    /// Ordered chunk checksums that reassemble the file
    pub chunks: Vec<ChunkChecksum>,
}

/// A chunk first stored by this batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewChunk {
    /// Chunk checksum
    pub checksum: ChunkChecksum,
    /// Content size
    pub size: u32,
    /// Where it was packed
    pub location: ChunkLocation,
}

/// Statistics from a dedup batch
#[derive(Debug, Default, Clone)]
pub struct DedupStats {
    /// Files processed
    pub files: usize,
    /// Total input bytes
    pub input_bytes: u64,
    /// Total chunks produced
    pub chunks_total: usize,
    /// Chunks eliminated by dedup
    pub chunks_deduplicated: usize,
    /// Content bytes packed into new multichunks
    pub bytes_packed: u64,
    /// Multichunks sealed
    pub multichunks_sealed: usize,
}

impl DedupStats {
    /// Input bytes per packed byte; 1.0 when nothing was packed
    pub fn dedup_ratio(&self) -> f64 {
        if self.bytes_packed == 0 {
            1.0
        } else {
            self.input_bytes as f64 / self.bytes_packed as f64
        }
    }
}

/// Everything a finished batch produced
#[derive(Debug, Default)]
pub struct DedupOutput {
    /// Chunks stored for the first time, in pack order
    pub new_chunks: Vec<NewChunk>,
    /// Multichunks not yet drained with [`Deduper::take_sealed`]
    pub sealed: Vec<SealedMultiChunk>,
    /// Batch statistics
    pub stats: DedupStats,
}

/// Drives chunking for a batch of files
pub struct Deduper {
    chunker: Chunker,
    packer: MultiChunkPacker,
    batch: ChunkIndex,
    new_chunks: Vec<NewChunk>,
    sealed: Vec<SealedMultiChunk>,
    stats: DedupStats,
}

impl Deduper {
    /// Create a deduper with the given chunker and packer settings
    pub fn new(chunker: Chunker, packer: PackerConfig) -> Self {
        Self {
            chunker,
            packer: MultiChunkPacker::new(packer),
            batch: ChunkIndex::new(),
            new_chunks: Vec::new(),
            sealed: Vec::new(),
            stats: DedupStats::default(),
        }
    }

    /// Chunk one file. Chunks that `known` already has, or that this batch
    /// already packed, are only referenced.
    #[instrument(skip(self, source, known))]
    pub fn add_file<R: Read>(
        &mut self,
        source: R,
        known: &dyn ChunkLookup,
    ) -> Result<IndexedFile, ChunkError> {
        let mut stream = self.chunker.chunk_stream(source);
        let mut chunks = Vec::new();
        for chunk in stream.by_ref() {
            let chunk = chunk?;
            self.stats.chunks_total += 1;
            chunks.push(chunk.checksum);
            if known.contains_chunk(&chunk.checksum) || self.batch.contains_chunk(&chunk.checksum) {
                self.stats.chunks_deduplicated += 1;
                continue;
            }
            let (location, sealed) = self.packer.add_chunk(&chunk)?;
            self.batch.insert(chunk.checksum, location);
            self.new_chunks.push(NewChunk {
                checksum: chunk.checksum,
                size: chunk.size() as u32,
                location,
            });
            self.stats.bytes_packed += chunk.size() as u64;
            if let Some(sealed) = sealed {
                self.stats.multichunks_sealed += 1;
                self.sealed.push(sealed);
            }
        }
        let checksum = stream
            .file_checksum()
            .ok_or_else(|| ChunkError::format("chunk stream ended early"))?;
        let size = stream.bytes_read();
        self.stats.files += 1;
        self.stats.input_bytes += size;
        debug!(file = %checksum, size, chunks = chunks.len(), "file indexed");
        Ok(IndexedFile {
            checksum,
            size,
            chunks,
        })
    }

    /// Drain multichunks sealed so far so they can be staged while indexing continues
    pub fn take_sealed(&mut self) -> Vec<SealedMultiChunk> {
        std::mem::take(&mut self.sealed)
    }

    /// Statistics so far
    pub fn stats(&self) -> &DedupStats {
        &self.stats
    }

    /// Seal the open multichunk and return the batch output
    pub fn finish(mut self) -> Result<DedupOutput, ChunkError> {
        if let Some(sealed) = self.packer.flush()? {
            self.stats.multichunks_sealed += 1;
            self.sealed.push(sealed);
        }
        debug!(
            files = self.stats.files,
            chunks = self.stats.chunks_total,
            deduplicated = self.stats.chunks_deduplicated,
            multichunks = self.stats.multichunks_sealed,
            "dedup batch finished"
        );
        Ok(DedupOutput {
            new_chunks: self.new_chunks,
            sealed: self.sealed,
            stats: self.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::fingerprint::file_checksum;
    use crate::index::NoChunks;
    use crate::multichunk::MultiChunkReader;
    use std::collections::HashMap;

    fn fixed_deduper(capacity: usize) -> Deduper {
        Deduper::new(
            Chunker::with_config(ChunkerConfig::FixedOffset { size: 100 }).unwrap(),
            PackerConfig { capacity },
        )
    }

    #[test]
    fn identical_files_pack_once() {
        let mut deduper = fixed_deduper(1 << 20);
        let data = vec![3u8; 1000];
        let a = deduper.add_file(&data[..], &NoChunks).unwrap();
        let b = deduper.add_file(&data[..], &NoChunks).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.checksum, file_checksum(&data));
        let out = deduper.finish().unwrap();
        // ten identical 100-byte chunks
        assert_eq!(out.new_chunks.len(), 1);
        assert_eq!(out.stats.chunks_total, 20);
        assert_eq!(out.stats.chunks_deduplicated, 19);
        assert_eq!(out.sealed.len(), 1);
    }

    #[test]
    fn known_chunks_are_not_packed() {
        let data: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let mut first = fixed_deduper(1 << 20);
        first.add_file(&data[..], &NoChunks).unwrap();
        let out = first.finish().unwrap();
        let mut known = ChunkIndex::new();
        for c in &out.new_chunks {
            known.insert(c.checksum, c.location);
        }

        let mut second = fixed_deduper(1 << 20);
        second.add_file(&data[..], &known).unwrap();
        let out = second.finish().unwrap();
        assert!(out.new_chunks.is_empty());
        assert!(out.sealed.is_empty());
    }

    #[test]
    fn packed_chunks_reassemble_file() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut deduper = fixed_deduper(300);
        let file = deduper.add_file(&data[..], &NoChunks).unwrap();
        let mut sealed = deduper.take_sealed();
        let out = deduper.finish().unwrap();
        sealed.extend(out.sealed);
        assert!(sealed.len() > 1);

        let mut store = HashMap::new();
        for mc in &sealed {
            for chunk in MultiChunkReader::open(&mc.bytes[..]).unwrap().read_all().unwrap() {
                store.insert(chunk.checksum, chunk.data);
            }
        }
        let rebuilt: Vec<u8> = file
            .chunks
            .iter()
            .flat_map(|c| store[c].iter().copied())
            .collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let mut deduper = fixed_deduper(1 << 20);
        let file = deduper.add_file(&[][..], &NoChunks).unwrap();
        assert!(file.chunks.is_empty());
        assert_eq!(file.size, 0);
        assert_eq!(file.checksum, file_checksum(&[]));
        assert!(deduper.finish().unwrap().sealed.is_empty());
    }
}
