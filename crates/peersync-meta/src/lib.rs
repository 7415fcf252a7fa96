#![warn(missing_docs)]

//! PeerSync metadata subsystem: vector clocks, versioned file metadata and the
//! append-only local database.

pub mod database;
pub mod database_file;
pub mod error;
pub mod header_order;
pub mod kvstore;
pub mod log;
pub mod remote_file;
pub mod types;
pub mod vector_clock;

pub use database::{Database, FileTreeFilter, LOG_FILE_NAME};
pub use database_file::{decode_database_version, encode_database_version};
pub use error::MetaError;
pub use header_order::{HeaderComparator, TieBreak};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use log::{LogRecord, RecordLog};
pub use remote_file::{
    RemoteFile, DATABASE_PREFIX, MULTICHUNK_PREFIX, TEMP_PREFIX, TRANSACTION_PREFIX,
};
pub use types::{
    ClientId, DatabaseVersion, DatabaseVersionHeader, FileContent, FileHistoryId, FileStatus,
    FileType, FileVersion, MultiChunkEntry, PartialFileHistory, Timestamp,
};
pub use vector_clock::{VectorClock, VectorClockComparison};
