//! Append-only record log backing the local database.
//!
//! Each record is framed as `[u32 BE payload length][32B BLAKE3 of payload][payload]`
//! with a bincode payload. A record that is cut short or fails its checksum ends
//! the log: it and anything after it are dropped on open, which is how a crash
//! in the middle of an append is recovered.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MetaError;
use crate::types::{DatabaseVersion, DatabaseVersionHeader};

const FRAME_HEADER: usize = 4 + 32;

/// One durable change to the local database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A database version became part of the local state.
    AddVersion(DatabaseVersion),
    /// Database versions were dropped after losing reconciliation.
    RemoveVersions(Vec<DatabaseVersionHeader>),
    /// Remote database files were analysed, whether or not they were applied.
    KnownDatabases(Vec<String>),
}

/// File-backed append-only log of [`LogRecord`]s.
pub struct RecordLog {
    path: PathBuf,
    file: File,
}

impl RecordLog {
    /// Open or create the log at `path` and return every intact record.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<LogRecord>), MetaError> {
        let path = path.as_ref().to_path_buf();
        let mut bytes = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut bytes)?;
        }

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            match decode_frame(&bytes[pos..]) {
                Some((record, used)) => {
                    records.push(record);
                    pos += used;
                }
                None => {
                    warn!(
                        path = %path.display(),
                        offset = pos,
                        dropped = bytes.len() - pos,
                        "torn or corrupt tail in database log, truncating"
                    );
                    break;
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if pos < bytes.len() {
            file.set_len(pos as u64)?;
            file.sync_all()?;
        }
        let mut log = Self { path, file };
        log.seek_end()?;
        debug!(path = %log.path.display(), records = records.len(), "database log opened");
        Ok((log, records))
    }

    fn seek_end(&mut self) -> Result<(), MetaError> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::End(0))?;
        Ok(())
    }

    /// Append a record and make it durable.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), MetaError> {
        let frame = encode_frame(record)?;
        self.file.write_all(&frame)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Serialize one record with its frame header.
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, MetaError> {
    let payload = bincode::serialize(record).map_err(|e| MetaError::format("log record", e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MetaError::format("log record", "record larger than 4 GiB"))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(blake3::hash(&payload).as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_frame(bytes: &[u8]) -> Option<(LogRecord, usize)> {
    if bytes.len() < FRAME_HEADER {
        return None;
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[..4]);
    let len = u32::from_be_bytes(len) as usize;
    let end = FRAME_HEADER.checked_add(len)?;
    if bytes.len() < end {
        return None;
    }
    let payload = &bytes[FRAME_HEADER..end];
    if blake3::hash(payload).as_bytes() != &bytes[4..FRAME_HEADER] {
        return None;
    }
    let record = bincode::deserialize(payload).ok()?;
    Some((record, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use crate::vector_clock::VectorClock;

    fn record(n: u64) -> LogRecord {
        let mut clock = VectorClock::new();
        clock.set("A", n);
        LogRecord::AddVersion(DatabaseVersion::new(DatabaseVersionHeader {
            client: "A".into(),
            timestamp: Timestamp::from_millis(n),
            vector_clock: clock,
        }))
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.log");
        {
            let (mut log, existing) = RecordLog::open(&path).unwrap();
            assert!(existing.is_empty());
            log.append(&record(1)).unwrap();
            log.append(&record(2)).unwrap();
        }
        let (_, records) = RecordLog::open(&path).unwrap();
        assert_eq!(records, vec![record(1), record(2)]);
    }

    #[test]
    fn torn_tail_is_dropped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.log");
        {
            let (mut log, _) = RecordLog::open(&path).unwrap();
            log.append(&record(1)).unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        let partial = encode_frame(&record(2)).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&partial[..partial.len() / 2]).unwrap();
        }
        let (mut log, records) = RecordLog::open(&path).unwrap();
        assert_eq!(records, vec![record(1)]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        log.append(&record(3)).unwrap();
        drop(log);
        let (_, records) = RecordLog::open(&path).unwrap();
        assert_eq!(records, vec![record(1), record(3)]);
    }

    #[test]
    fn corrupt_payload_ends_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.log");
        let mut bytes = encode_frame(&record(1)).unwrap();
        let second = encode_frame(&record(2)).unwrap();
        let flip = bytes.len() + FRAME_HEADER + 1;
        bytes.extend_from_slice(&second);
        bytes[flip] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        let (_, records) = RecordLog::open(&path).unwrap();
        assert_eq!(records, vec![record(1)]);
    }
}
