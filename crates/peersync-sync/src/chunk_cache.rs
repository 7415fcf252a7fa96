//! On-disk cache of chunks unpacked from downloaded multichunks.
//!
//! Each chunk is one file named by its hex checksum. File contents are
//! reassembled by streaming the chunk files in order.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use peersync_chunk::{chunk_checksum, Chunk, ChunkChecksum};
use uuid::Uuid;

/// Directory of cached chunks
#[derive(Debug, Clone)]
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    /// Use (and create) `dir`
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, checksum: &ChunkChecksum) -> PathBuf {
        self.dir.join(checksum.to_hex())
    }

    /// True if the chunk is cached
    pub fn contains(&self, checksum: &ChunkChecksum) -> bool {
        self.path(checksum).is_file()
    }

    /// Store a chunk unless it is already cached
    pub fn put(&self, chunk: &Chunk) -> io::Result<()> {
        if chunk_checksum(&chunk.data) != chunk.checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk {} does not match its checksum", chunk.checksum.to_hex()),
            ));
        }
        let path = self.path(&chunk.checksum);
        if path.is_file() {
            return Ok(());
        }
        let tmp = self.dir.join(format!(".{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&chunk.data)?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp, &path)
    }

    /// Cached chunk content
    pub fn read(&self, checksum: &ChunkChecksum) -> io::Result<Vec<u8>> {
        fs::read(self.path(checksum))
    }

    /// Reader over the concatenation of `chunks`
    pub fn open_content(&self, chunks: &[ChunkChecksum]) -> ContentReader {
        ContentReader {
            paths: chunks.iter().map(|c| self.path(c)).collect(),
            next: 0,
            current: None,
        }
    }

    /// Remove every cached chunk
    pub fn clear(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Streams cached chunks one after another
pub struct ContentReader {
    paths: Vec<PathBuf>,
    next: usize,
    current: Option<fs::File>,
}

impl Read for ContentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }
            let Some(path) = self.paths.get(self.next) else {
                return Ok(0);
            };
            self.current = Some(fs::File::open(path)?);
            self.next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(data: &'static [u8]) -> Chunk {
        Chunk::new(Bytes::from_static(data), 0)
    }

    #[test]
    fn content_is_reassembled_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path().join("cache")).unwrap();
        let a = chunk(b"hello ");
        let b = chunk(b"world");
        cache.put(&a).unwrap();
        cache.put(&b).unwrap();
        cache.put(&a).unwrap();
        assert!(cache.contains(&a.checksum));

        let mut out = String::new();
        cache
            .open_content(&[a.checksum, b.checksum, a.checksum])
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello worldhello ");
    }

    #[test]
    fn corrupt_chunk_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path()).unwrap();
        let mut c = chunk(b"data");
        c.data = Bytes::from_static(b"evil");
        assert_eq!(cache.put(&c).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_chunk_fails_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path()).unwrap();
        let c = chunk(b"never stored");
        let mut buf = Vec::new();
        assert!(cache.open_content(&[c.checksum]).read_to_end(&mut buf).is_err());
        assert!(cache.read(&c.checksum).is_err());
    }
}
