//! Core metadata types: file histories, file versions and database versions.

use std::collections::BTreeMap;
use std::fmt;

use peersync_chunk::{ChunkChecksum, FileChecksum, MultiChunkId, PackedEntry};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vector_clock::VectorClock;

/// Identifier of a sync client. Appears in vector clocks and remote file names.
pub type ClientId = String;

/// Wall-clock timestamp with nanosecond precision
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// Build from milliseconds since Unix epoch
    pub fn from_millis(millis: u64) -> Self {
        Self {
            secs: millis / 1000,
            nanos: ((millis % 1000) * 1_000_000) as u32,
        }
    }

    /// Milliseconds since Unix epoch
    pub fn as_millis(&self) -> u64 {
        self.secs * 1000 + (self.nanos / 1_000_000) as u64
    }

    /// Build from a filesystem modification time
    pub fn from_system_time(time: std::time::SystemTime) -> Self {
        let since = time
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    /// UTC calendar date as `yyyy-mm-dd`
    pub fn date_string(&self) -> String {
        chrono::DateTime::from_timestamp(self.secs as i64, self.nanos)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "1970-01-01".to_string())
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Stable identity of one file or folder across renames
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHistoryId(pub Uuid);

impl FileHistoryId {
    /// A fresh random history id
    pub fn new_random() -> Self {
        FileHistoryId(Uuid::new_v4())
    }
}

impl fmt::Display for FileHistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Kind of filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Folder,
    /// Symbolic link
    Symlink,
}

/// What happened to the entry in this version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    /// First version of the history
    New,
    /// Content or attributes changed
    Changed,
    /// Path changed, content unchanged
    Renamed,
    /// Entry removed
    Deleted,
}

/// One immutable state of a file history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// History this version belongs to
    pub history_id: FileHistoryId,
    /// Monotonic version number within the history, starting at 1
    pub version: u64,
    /// Path relative to the sync root, `/`-separated
    pub path: String,
    /// Entry kind
    pub file_type: FileType,
    /// Change status
    pub status: FileStatus,
    /// Content size in bytes (0 for folders and symlinks)
    pub size: u64,
    /// Last modification time on disk
    pub last_modified: Timestamp,
    /// When this version was recorded
    pub updated: Timestamp,
    /// Content checksum for regular files
    pub checksum: Option<FileChecksum>,
    /// Symlink target
    pub link_target: Option<String>,
    /// POSIX permission bits
    pub posix_permissions: Option<u32>,
    /// DOS attribute bits
    pub dos_attributes: Option<u8>,
}

impl FileVersion {
    /// True if this version marks the entry as removed
    pub fn is_deleted(&self) -> bool {
        self.status == FileStatus::Deleted
    }

    /// A copy with the next version number and the given status
    pub fn successor(&self, status: FileStatus) -> FileVersion {
        FileVersion {
            version: self.version + 1,
            status,
            updated: Timestamp::now(),
            ..self.clone()
        }
    }

    /// Same content and type, ignoring path, status and bookkeeping fields
    pub fn same_content(&self, other: &FileVersion) -> bool {
        self.file_type == other.file_type
            && self.checksum == other.checksum
            && self.size == other.size
            && self.link_target == other.link_target
    }

    /// Same permission and attribute bits
    pub fn same_attributes(&self, other: &FileVersion) -> bool {
        self.posix_permissions == other.posix_permissions
            && self.dos_attributes == other.dos_attributes
    }
}

/// Ordered versions of one file history, possibly only a suffix of it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFileHistory {
    /// History identity
    pub id: FileHistoryId,
    /// Versions keyed by version number
    pub versions: BTreeMap<u64, FileVersion>,
}

impl PartialFileHistory {
    /// An empty history
    pub fn new(id: FileHistoryId) -> Self {
        Self {
            id,
            versions: BTreeMap::new(),
        }
    }

    /// Add or replace a version
    pub fn add_version(&mut self, version: FileVersion) {
        self.versions.insert(version.version, version);
    }

    /// Current state as known here
    pub fn last_version(&self) -> Option<&FileVersion> {
        self.versions.values().next_back()
    }
}

/// Identity of one database version
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseVersionHeader {
    /// Client that produced the version
    pub client: ClientId,
    /// When it was produced
    pub timestamp: Timestamp,
    /// Clock snapshot; the producing client's counter is the remote sequence number
    pub vector_clock: VectorClock,
}

impl DatabaseVersionHeader {
    /// The producing client's own counter, used as the remote file sequence
    pub fn sequence(&self) -> u64 {
        self.vector_clock.get(&self.client)
    }
}

impl fmt::Display for DatabaseVersionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.vector_clock)
    }
}

/// A multichunk and the chunk records it holds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkEntry {
    /// Container id
    pub id: MultiChunkId,
    /// Records in container order
    pub chunks: Vec<PackedEntry>,
}

/// Ordered chunk list of one file content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    /// Whole-content checksum
    pub checksum: FileChecksum,
    /// Content size
    pub size: u64,
    /// Chunks that reassemble the content
    pub chunks: Vec<ChunkChecksum>,
}

/// One client's atomic batch of metadata changes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersion {
    /// Identity of the batch
    pub header: DatabaseVersionHeader,
    /// File history deltas
    pub file_histories: Vec<PartialFileHistory>,
    /// New multichunks and the chunks they store
    pub multichunks: Vec<MultiChunkEntry>,
    /// New file contents
    pub file_contents: Vec<FileContent>,
}

impl DatabaseVersion {
    /// A version with no changes
    pub fn new(header: DatabaseVersionHeader) -> Self {
        Self {
            header,
            file_histories: Vec::new(),
            multichunks: Vec::new(),
            file_contents: Vec::new(),
        }
    }

    /// True if nothing changed
    pub fn is_empty(&self) -> bool {
        self.file_histories.is_empty() && self.multichunks.is_empty() && self.file_contents.is_empty()
    }

    /// Total chunk records introduced
    pub fn chunk_count(&self) -> usize {
        self.multichunks.iter().map(|m| m.chunks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_millis_roundtrip() {
        let ts = Timestamp::from_millis(1_700_000_123_456);
        assert_eq!(ts.as_millis(), 1_700_000_123_456);
        assert!(Timestamp::from_millis(1) < Timestamp::from_millis(2));
    }

    #[test]
    fn date_string_is_utc_day() {
        assert_eq!(Timestamp::from_millis(0).date_string(), "1970-01-01");
        assert_eq!(Timestamp { secs: 1_700_000_000, nanos: 0 }.date_string(), "2023-11-14");
    }

    #[test]
    fn last_version_is_highest() {
        let id = FileHistoryId::new_random();
        let mut history = PartialFileHistory::new(id);
        let v1 = FileVersion {
            history_id: id,
            version: 1,
            path: "a.txt".into(),
            file_type: FileType::File,
            status: FileStatus::New,
            size: 0,
            last_modified: Timestamp::default(),
            updated: Timestamp::default(),
            checksum: None,
            link_target: None,
            posix_permissions: None,
            dos_attributes: None,
        };
        let v2 = v1.successor(FileStatus::Renamed);
        history.add_version(v2.clone());
        history.add_version(v1);
        assert_eq!(history.last_version(), Some(&v2));
        assert_eq!(v2.version, 2);
    }
}
