#![warn(missing_docs)]

//! PeerSync chunking subsystem: content-defined chunking (FastCDC/BLAKE3), multichunk
//! packing, compression (LZ4/Zstd) and encryption (AES-GCM/ChaCha20-Poly1305)
//!
//! Write path: File → Chunk (FastCDC) → Fingerprint (BLAKE3) → Dedupe → Pack → Transform → Upload
//! Read path:  Download → Reverse transform → Unpack → Reassemble

pub mod chunker;
pub mod compression;
pub mod deduper;
pub mod encryption;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod multichunk;
pub mod packer;
pub mod transform;

pub use chunker::{Chunk, ChunkStream, Chunker, ChunkerConfig, MAX_CHUNK_SIZE};
pub use compression::CompressionAlgorithm;
pub use deduper::{DedupOutput, DedupStats, Deduper, IndexedFile, NewChunk};
pub use encryption::{EncryptionAlgorithm, EncryptionKey};
pub use error::ChunkError;
pub use fingerprint::{chunk_checksum, file_checksum, file_checksum_reader, ChunkChecksum, FileChecksum, MultiChunkId};
pub use index::{ChunkIndex, ChunkLocation, ChunkLookup, ContentIndex, NoChunks};
pub use multichunk::{MultiChunkReader, MultiChunkWriter, DEFAULT_MULTICHUNK_CAPACITY};
pub use packer::{MultiChunkPacker, PackedEntry, PackerConfig, SealedMultiChunk};
pub use transform::{Transform, TransformChain};
