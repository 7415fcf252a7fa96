//! In-memory chunk and content indexes used for deduplication within a cycle.

use crate::fingerprint::{ChunkChecksum, FileChecksum, MultiChunkId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Answers "is this chunk already stored somewhere?" for the deduper.
pub trait ChunkLookup {
    /// True if the chunk is already persisted (or scheduled to be)
    fn contains_chunk(&self, checksum: &ChunkChecksum) -> bool;
}

/// A lookup that knows no chunks; every chunk is new.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChunks;

impl ChunkLookup for NoChunks {
    fn contains_chunk(&self, _checksum: &ChunkChecksum) -> bool {
        false
    }
}

/// Position of a chunk record inside a multichunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// Container holding the chunk
    pub multichunk_id: MultiChunkId,
    /// Byte offset of the record in the untransformed container
    pub offset: u32,
}

/// Chunk checksum to multichunk location
#[derive(Debug, Default, Clone)]
pub struct ChunkIndex {
    entries: HashMap<ChunkChecksum, ChunkLocation>,
}

impl ChunkIndex {
    /// Create a new empty chunk index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where a chunk is stored. The first location recorded wins.
    pub fn insert(&mut self, checksum: ChunkChecksum, location: ChunkLocation) -> bool {
        if self.entries.contains_key(&checksum) {
            return false;
        }
        self.entries.insert(checksum, location);
        true
    }

    /// Location of a chunk, if indexed
    pub fn get(&self, checksum: &ChunkChecksum) -> Option<&ChunkLocation> {
        self.entries.get(checksum)
    }

    /// Number of unique chunks tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no chunks are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChunkLookup for ChunkIndex {
    fn contains_chunk(&self, checksum: &ChunkChecksum) -> bool {
        self.entries.contains_key(checksum)
    }
}

/// File content checksum to its ordered chunk list
#[derive(Debug, Default, Clone)]
pub struct ContentIndex {
    entries: HashMap<FileChecksum, Vec<ChunkChecksum>>,
}

impl ContentIndex {
    /// Create a new empty content index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the chunk list of a content checksum
    pub fn insert(&mut self, checksum: FileChecksum, chunks: Vec<ChunkChecksum>) {
        self.entries.entry(checksum).or_insert(chunks);
    }

    /// Ordered chunks of a content checksum
    pub fn chunks(&self, checksum: &FileChecksum) -> Option<&[ChunkChecksum]> {
        self.entries.get(checksum).map(Vec::as_slice)
    }

    /// True if the content is indexed
    pub fn contains(&self, checksum: &FileChecksum) -> bool {
        self.entries.contains_key(checksum)
    }

    /// Number of distinct contents tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{chunk_checksum, file_checksum};

    #[test]
    fn chunk_index_first_location_wins() {
        let mut index = ChunkIndex::new();
        let c = chunk_checksum(b"a");
        let first = ChunkLocation {
            multichunk_id: MultiChunkId([1; 32]),
            offset: 34,
        };
        let second = ChunkLocation {
            multichunk_id: MultiChunkId([2; 32]),
            offset: 34,
        };
        assert!(index.insert(c, first));
        assert!(!index.insert(c, second));
        assert_eq!(index.get(&c), Some(&first));
        assert!(index.contains_chunk(&c));
        assert!(!index.contains_chunk(&chunk_checksum(b"b")));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn content_index_keeps_order() {
        let mut index = ContentIndex::new();
        let f = file_checksum(b"ab");
        let chunks = vec![chunk_checksum(b"a"), chunk_checksum(b"b")];
        index.insert(f, chunks.clone());
        assert_eq!(index.chunks(&f), Some(chunks.as_slice()));
        assert!(index.contains(&f));
        assert!(!NoChunks.contains_chunk(&chunks[0]));
    }
}
