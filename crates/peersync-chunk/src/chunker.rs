//! Content-defined (FastCDC) and fixed-offset chunking over streaming sources

use crate::error::ChunkError;
use crate::fingerprint::{chunk_checksum, ChunkChecksum, FileChecksum};
use bytes::Bytes;
use fastcdc::v2020::StreamCDC;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Largest chunk the multichunk record format can hold (2-byte length field).
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// A chunk produced by a [`Chunker`]. Immutable once created; identity is the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// BLAKE3 checksum of the chunk content (CAS key)
    pub checksum: ChunkChecksum,
    /// Byte offset of this chunk in the original data stream
    pub offset: u64,
}

impl Chunk {
    /// Create a chunk from raw content, computing its checksum
    pub fn new(data: Bytes, offset: u64) -> Self {
        let checksum = chunk_checksum(&data);
        Self {
            data,
            checksum,
            offset,
        }
    }

    /// Size of the chunk content in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Chunking strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChunkerConfig {
    /// FastCDC: boundaries chosen by a gear rolling hash over the content
    ContentDefined {
        /// Minimum chunk size in bytes
        min_size: usize,
        /// Average (target) chunk size in bytes
        avg_size: usize,
        /// Maximum chunk size in bytes
        max_size: usize,
    },
    /// A boundary every `size` bytes
    FixedOffset {
        /// Chunk size in bytes
        size: usize,
    },
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig::ContentDefined {
            min_size: 4 * 1024,
            avg_size: 16 * 1024,
            max_size: MAX_CHUNK_SIZE,
        }
    }
}

impl ChunkerConfig {
    /// Check the sizes against FastCDC's limits and the multichunk record format
    pub fn validate(&self) -> Result<(), ChunkError> {
        match *self {
            ChunkerConfig::ContentDefined {
                min_size,
                avg_size,
                max_size,
            } => {
                if min_size < fastcdc::v2020::MINIMUM_MIN as usize
                    || avg_size < fastcdc::v2020::AVERAGE_MIN as usize
                    || max_size < fastcdc::v2020::MAXIMUM_MIN as usize
                {
                    return Err(ChunkError::InvalidConfig(format!(
                        "chunk sizes below FastCDC minimums: min={} avg={} max={}",
                        min_size, avg_size, max_size
                    )));
                }
                if !(min_size <= avg_size && avg_size <= max_size) {
                    return Err(ChunkError::InvalidConfig(format!(
                        "chunk sizes must satisfy min <= avg <= max: min={} avg={} max={}",
                        min_size, avg_size, max_size
                    )));
                }
                if max_size > MAX_CHUNK_SIZE {
                    return Err(ChunkError::InvalidConfig(format!(
                        "max chunk size {} exceeds record limit {}",
                        max_size, MAX_CHUNK_SIZE
                    )));
                }
            }
            ChunkerConfig::FixedOffset { size } => {
                if size == 0 || size > MAX_CHUNK_SIZE {
                    return Err(ChunkError::InvalidConfig(format!(
                        "fixed chunk size must be within 1..={}, got {}",
                        MAX_CHUNK_SIZE, size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Splits byte streams into chunks according to a [`ChunkerConfig`]
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker {
    /// Create a content-defined chunker with default sizes
    pub fn new() -> Self {
        Self {
            config: ChunkerConfig::default(),
        }
    }

    /// Create a chunker with custom configuration
    pub fn with_config(config: ChunkerConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The active configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Start lazily chunking `source`. The stream is single-pass.
    pub fn chunk_stream<R: Read>(&self, source: R) -> ChunkStream<R> {
        let inner = match self.config {
            ChunkerConfig::ContentDefined {
                min_size,
                avg_size,
                max_size,
            } => Inner::Cdc(StreamCDC::new(
                source,
                min_size as u32,
                avg_size as u32,
                max_size as u32,
            )),
            ChunkerConfig::FixedOffset { size } => Inner::Fixed { source, size },
        };
        ChunkStream {
            inner,
            file_hasher: blake3::Hasher::new(),
            offset: 0,
            finished: false,
        }
    }

    /// Chunk an in-memory buffer. Concatenating all chunk data reconstructs the input.
    pub fn chunk(&self, data: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        self.chunk_stream(data).collect()
    }
}

enum Inner<R: Read> {
    Cdc(StreamCDC<R>),
    Fixed { source: R, size: usize },
}

/// Lazy sequence of chunks over a reader.
///
/// Every byte that passes through is also folded into a whole-file checksum,
/// available from [`ChunkStream::file_checksum`] once the stream is exhausted.
pub struct ChunkStream<R: Read> {
    inner: Inner<R>,
    file_hasher: blake3::Hasher,
    offset: u64,
    finished: bool,
}

impl<R: Read> ChunkStream<R> {
    /// Checksum of everything read, or None while chunks are still pending
    pub fn file_checksum(&self) -> Option<FileChecksum> {
        if self.finished {
            Some(FileChecksum(*self.file_hasher.finalize().as_bytes()))
        } else {
            None
        }
    }

    /// Number of bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    fn next_raw(&mut self) -> Option<Result<Vec<u8>, ChunkError>> {
        match &mut self.inner {
            Inner::Cdc(cdc) => cdc.next().map(|res| {
                res.map(|c| c.data).map_err(|e| {
                    ChunkError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("{:?}", e),
                    ))
                })
            }),
            Inner::Fixed { source, size } => {
                let mut buf = vec![0u8; *size];
                let mut filled = 0;
                while filled < buf.len() {
                    match source.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Some(Err(ChunkError::Io(e))),
                    }
                }
                if filled == 0 {
                    None
                } else {
                    buf.truncate(filled);
                    Some(Ok(buf))
                }
            }
        }
    }
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_raw() {
            None => {
                self.finished = true;
                None
            }
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            Some(Ok(data)) => {
                self.file_hasher.update(&data);
                let chunk = Chunk::new(Bytes::from(data), self.offset);
                self.offset += chunk.size() as u64;
                Some(Ok(chunk))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::file_checksum;
    use proptest::prelude::*;

    fn sample(len: usize) -> Vec<u8> {
        // xorshift so FastCDC sees non-periodic content
        let mut x: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn chunks_reassemble() {
        let data = sample(200_000);
        let chunks = Chunker::new().chunk(&data).unwrap();
        assert!(!chunks.is_empty());
        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn empty_data_no_chunks() {
        assert!(Chunker::new().chunk(&[]).unwrap().is_empty());
        let fixed = Chunker::with_config(ChunkerConfig::FixedOffset { size: 100 }).unwrap();
        assert!(fixed.chunk(&[]).unwrap().is_empty());
    }

    #[test]
    fn chunks_respect_record_limit() {
        let data = sample(1_000_000);
        for chunk in Chunker::new().chunk(&data).unwrap() {
            assert!(chunk.size() <= MAX_CHUNK_SIZE);
        }
    }

    #[test]
    fn fixed_offset_boundaries() {
        let chunker = Chunker::with_config(ChunkerConfig::FixedOffset { size: 1000 }).unwrap();
        let chunks = chunker.chunk(&sample(2500)).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.size()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(chunks[1].offset, 1000);
        assert_eq!(chunks[2].offset, 2000);
    }

    #[test]
    fn file_checksum_available_after_exhaustion() {
        let data = sample(50_000);
        let mut stream = Chunker::new().chunk_stream(&data[..]);
        assert!(stream.file_checksum().is_none());
        let count = stream.by_ref().filter_map(Result::ok).count();
        assert!(count > 0);
        assert_eq!(stream.file_checksum(), Some(file_checksum(&data)));
        assert_eq!(stream.bytes_read(), data.len() as u64);
    }

    #[test]
    fn chunking_twice_yields_identical_checksums() {
        let data = sample(300_000);
        let a: Vec<_> = Chunker::new().chunk(&data).unwrap().into_iter().map(|c| c.checksum).collect();
        let b: Vec<_> = Chunker::new().chunk(&data).unwrap().into_iter().map(|c| c.checksum).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn local_edit_keeps_most_chunks() {
        let original = sample(400_000);
        let mut edited = original.clone();
        for b in &mut edited[200_000..200_010] {
            *b = b.wrapping_add(1);
        }
        let chunker = Chunker::new();
        let before: std::collections::HashSet<_> =
            chunker.chunk(&original).unwrap().into_iter().map(|c| c.checksum).collect();
        let after: Vec<_> = chunker.chunk(&edited).unwrap().into_iter().map(|c| c.checksum).collect();
        let shared = after.iter().filter(|c| before.contains(c)).count();
        assert!(shared + 3 >= after.len(), "shared {} of {}", shared, after.len());
    }

    #[test]
    fn invalid_configs_rejected() {
        assert!(Chunker::with_config(ChunkerConfig::FixedOffset { size: 0 }).is_err());
        assert!(Chunker::with_config(ChunkerConfig::FixedOffset { size: 70_000 }).is_err());
        assert!(Chunker::with_config(ChunkerConfig::ContentDefined {
            min_size: 8192,
            avg_size: 4096,
            max_size: 65_535,
        })
        .is_err());
        assert!(Chunker::with_config(ChunkerConfig::ContentDefined {
            min_size: 4096,
            avg_size: 16_384,
            max_size: 1 << 20,
        })
        .is_err());
    }

    proptest! {
        #[test]
        fn prop_chunks_reassemble(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let chunks = Chunker::new().chunk(&data).unwrap();
            let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(reassembled, data);
        }

        #[test]
        fn prop_fixed_reassemble(data in prop::collection::vec(0u8..=255, 0..20_000), size in 1usize..5000) {
            let chunker = Chunker::with_config(ChunkerConfig::FixedOffset { size }).unwrap();
            let chunks = chunker.chunk(&data).unwrap();
            let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(reassembled, data);
        }
    }
}
