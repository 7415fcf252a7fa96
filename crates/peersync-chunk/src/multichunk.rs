//! Multichunk binary container.
//!
//! Layout (big-endian):
//!
//! ```text
//! [1B id length][id bytes][1B checksum length]
//! { [checksum bytes][2B content length][content bytes] }*
//! ```
//!
//! Records run until end of stream; there is no terminator record.

use crate::chunker::{Chunk, MAX_CHUNK_SIZE};
use crate::error::ChunkError;
use crate::fingerprint::{chunk_checksum, ChunkChecksum, MultiChunkId, CHECKSUM_LEN};
use bytes::Bytes;
use std::io::{ErrorKind, Read, Write};
use tracing::trace;

/// Default multichunk capacity: 4 MiB of chunk content
pub const DEFAULT_MULTICHUNK_CAPACITY: usize = 4 * 1024 * 1024;

/// Streams chunks into a multichunk container
pub struct MultiChunkWriter<W: Write> {
    id: MultiChunkId,
    sink: W,
    capacity: usize,
    size: usize,
    chunk_count: usize,
}

impl<W: Write> MultiChunkWriter<W> {
    /// Create a writer and emit the container header
    pub fn new(id: MultiChunkId, mut sink: W, capacity: usize) -> Result<Self, ChunkError> {
        sink.write_all(&[CHECKSUM_LEN as u8])?;
        sink.write_all(id.as_bytes())?;
        sink.write_all(&[CHECKSUM_LEN as u8])?;
        Ok(Self {
            id,
            sink,
            capacity,
            size: 0,
            chunk_count: 0,
        })
    }

    /// Id of the multichunk being written
    pub fn id(&self) -> MultiChunkId {
        self.id
    }

    /// Append one chunk record
    pub fn write(&mut self, chunk: &Chunk) -> Result<(), ChunkError> {
        if chunk.size() > MAX_CHUNK_SIZE {
            return Err(ChunkError::format(format!(
                "chunk of {} bytes does not fit a record",
                chunk.size()
            )));
        }
        self.sink.write_all(chunk.checksum.as_bytes())?;
        self.sink.write_all(&(chunk.size() as u16).to_be_bytes())?;
        self.sink.write_all(&chunk.data)?;
        self.size += chunk.size();
        self.chunk_count += 1;
        trace!(multichunk = %self.id, chunk = ?chunk.checksum, size = self.size, "record written");
        Ok(())
    }

    /// True once the accumulated content size has reached the capacity
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    /// Accumulated chunk content size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of records written
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Flush and release the sink
    pub fn close(mut self) -> Result<W, ChunkError> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// Reads chunks back from a multichunk container in write order
pub struct MultiChunkReader<R: Read> {
    id: MultiChunkId,
    source: R,
}

/// Fill `buf` completely; Ok(false) when the source was already at EOF
fn read_full_or_eof<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<bool, ChunkError> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(ChunkError::format(format!(
                    "truncated multichunk: expected {} bytes, got {}",
                    buf.len(),
                    filled
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChunkError::Io(e)),
        }
    }
    Ok(true)
}

fn read_exact_or_format<R: Read>(source: &mut R, buf: &mut [u8], what: &str) -> Result<(), ChunkError> {
    if buf.is_empty() {
        return Ok(());
    }
    if read_full_or_eof(source, buf)? {
        Ok(())
    } else {
        Err(ChunkError::format(format!("truncated multichunk: missing {}", what)))
    }
}

impl<R: Read> MultiChunkReader<R> {
    /// Open a container, consuming and validating its header
    pub fn open(mut source: R) -> Result<Self, ChunkError> {
        let mut len = [0u8; 1];
        read_exact_or_format(&mut source, &mut len, "id length")?;
        let mut id_bytes = vec![0u8; len[0] as usize];
        read_exact_or_format(&mut source, &mut id_bytes, "id")?;
        let id = MultiChunkId::from_slice(&id_bytes)?;
        read_exact_or_format(&mut source, &mut len, "checksum length")?;
        if len[0] as usize != CHECKSUM_LEN {
            return Err(ChunkError::format(format!(
                "unsupported checksum length {}",
                len[0]
            )));
        }
        Ok(Self { id, source })
    }

    /// Id recorded in the container header
    pub fn id(&self) -> MultiChunkId {
        self.id
    }

    /// Next chunk, or None at a clean end of stream
    pub fn read(&mut self) -> Result<Option<Chunk>, ChunkError> {
        let mut checksum = [0u8; CHECKSUM_LEN];
        if !read_full_or_eof(&mut self.source, &mut checksum)? {
            return Ok(None);
        }
        let mut len = [0u8; 2];
        read_exact_or_format(&mut self.source, &mut len, "record length")?;
        let mut content = vec![0u8; u16::from_be_bytes(len) as usize];
        read_exact_or_format(&mut self.source, &mut content, "record content")?;

        let expected = ChunkChecksum(checksum);
        let computed = chunk_checksum(&content);
        if computed != expected {
            return Err(ChunkError::ChecksumMismatch {
                expected: expected.to_hex(),
                computed: computed.to_hex(),
            });
        }
        Ok(Some(Chunk {
            data: Bytes::from(content),
            checksum: expected,
            offset: 0,
        }))
    }

    /// Read every remaining chunk
    pub fn read_all(&mut self) -> Result<Vec<Chunk>, ChunkError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use proptest::prelude::*;

    fn chunk(data: &[u8]) -> Chunk {
        Chunk::new(Bytes::copy_from_slice(data), 0)
    }

    fn pack(chunks: &[Chunk]) -> (MultiChunkId, Vec<u8>) {
        let id = MultiChunkId::random();
        let mut writer = MultiChunkWriter::new(id, Vec::new(), DEFAULT_MULTICHUNK_CAPACITY).unwrap();
        for c in chunks {
            writer.write(c).unwrap();
        }
        (id, writer.close().unwrap())
    }

    #[test]
    fn header_layout() {
        let id = MultiChunkId([7u8; 32]);
        let writer = MultiChunkWriter::new(id, Vec::new(), 10).unwrap();
        let bytes = writer.close().unwrap();
        assert_eq!(bytes.len(), 1 + 32 + 1);
        assert_eq!(bytes[0], 32);
        assert_eq!(&bytes[1..33], &[7u8; 32]);
        assert_eq!(bytes[33], 32);
    }

    #[test]
    fn record_layout_is_big_endian() {
        let c = chunk(&[0xaa; 300]);
        let (_, bytes) = pack(std::slice::from_ref(&c));
        let record = &bytes[34..];
        assert_eq!(&record[..32], c.checksum.as_bytes());
        assert_eq!(&record[32..34], &[0x01, 0x2c]);
        assert_eq!(record.len(), 32 + 2 + 300);
    }

    #[test]
    fn reads_in_write_order_then_end_marker() {
        let chunks = vec![chunk(b"one"), chunk(b"two"), chunk(b"three")];
        let (id, bytes) = pack(&chunks);
        let mut reader = MultiChunkReader::open(&bytes[..]).unwrap();
        assert_eq!(reader.id(), id);
        for expected in &chunks {
            let got = reader.read().unwrap().unwrap();
            assert_eq!(got.data, expected.data);
            assert_eq!(got.checksum, expected.checksum);
        }
        assert!(reader.read().unwrap().is_none());
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn empty_container_reads_nothing() {
        let (_, bytes) = pack(&[]);
        let mut reader = MultiChunkReader::open(&bytes[..]).unwrap();
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_format_error() {
        let (_, bytes) = pack(&[chunk(b"hello world")]);
        for cut in [35, 34 + 32, 34 + 33, bytes.len() - 1] {
            let mut reader = MultiChunkReader::open(&bytes[..cut]).unwrap();
            assert!(
                matches!(reader.read(), Err(ChunkError::Format { .. })),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn truncated_header_is_format_error() {
        let (_, bytes) = pack(&[]);
        assert!(matches!(
            MultiChunkReader::open(&bytes[..10]),
            Err(ChunkError::Format { .. })
        ));
        assert!(matches!(
            MultiChunkReader::open(&[][..]),
            Err(ChunkError::Format { .. })
        ));
    }

    #[test]
    fn flipped_content_byte_is_checksum_mismatch() {
        let (_, mut bytes) = pack(&[chunk(b"important data")]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let mut reader = MultiChunkReader::open(&bytes[..]).unwrap();
        let err = reader.read().unwrap_err();
        assert!(matches!(err, ChunkError::ChecksumMismatch { .. }));
        assert!(err.is_integrity());
    }

    #[test]
    fn is_full_tracks_capacity() {
        let mut writer = MultiChunkWriter::new(MultiChunkId::random(), Vec::new(), 10).unwrap();
        writer.write(&chunk(b"12345")).unwrap();
        assert!(!writer.is_full());
        writer.write(&chunk(b"67890")).unwrap();
        assert!(writer.is_full());
        assert_eq!(writer.size(), 10);
        assert_eq!(writer.chunk_count(), 2);
    }

    proptest! {
        #[test]
        fn prop_chunked_stream_survives_container(data in prop::collection::vec(0u8..=255, 0..60_000)) {
            let chunks = Chunker::new().chunk(&data).unwrap();
            let (_, bytes) = pack(&chunks);
            let read_back = MultiChunkReader::open(&bytes[..]).unwrap().read_all().unwrap();
            let reassembled: Vec<u8> = read_back.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(reassembled, data);
        }
    }
}
