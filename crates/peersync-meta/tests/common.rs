//! Shared fixtures for the metadata integration tests.

#![allow(dead_code)]

use peersync_meta::{
    DatabaseVersion, DatabaseVersionHeader, FileHistoryId, FileStatus, FileType, FileVersion,
    PartialFileHistory, Timestamp, VectorClock,
};

/// Header for `client` with the given clock entries
pub fn header(client: &str, clock: &[(&str, u64)], millis: u64) -> DatabaseVersionHeader {
    DatabaseVersionHeader {
        client: client.to_string(),
        timestamp: Timestamp::from_millis(millis),
        vector_clock: clock.iter().map(|(c, v)| (*c, *v)).collect::<VectorClock>(),
    }
}

/// A regular file version whose checksum is derived from `content`
pub fn file_version(
    id: FileHistoryId,
    version: u64,
    path: &str,
    status: FileStatus,
    content: &[u8],
) -> FileVersion {
    FileVersion {
        history_id: id,
        version,
        path: path.to_string(),
        file_type: FileType::File,
        status,
        size: content.len() as u64,
        last_modified: Timestamp::from_millis(version * 1000),
        updated: Timestamp::from_millis(version * 1000),
        checksum: Some(peersync_chunk::file_checksum(content)),
        link_target: None,
        posix_permissions: Some(0o644),
        dos_attributes: None,
    }
}

/// A database version carrying one version of each given history
pub fn database_version(header: DatabaseVersionHeader, files: Vec<FileVersion>) -> DatabaseVersion {
    let mut version = DatabaseVersion::new(header);
    for file in files {
        let mut history = PartialFileHistory::new(file.history_id);
        history.add_version(file);
        version.file_histories.push(history);
    }
    version
}
