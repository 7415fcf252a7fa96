#![warn(missing_docs)]

//! PeerSync sync subsystem: remote storage capability, transactional uploader,
//! branch reconciliation, filesystem actions and per-folder scheduling

pub mod actions;
pub mod apply;
pub mod cancel;
pub mod chunk_cache;
pub mod config;
pub mod context;
pub mod down;
pub mod error;
pub mod fs;
pub mod indexer;
pub mod options;
pub mod ordering;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod telemetry;
pub mod transaction;
pub mod up;

pub use actions::{plan_actions, FileSystemAction, PlanInput};
pub use apply::{ActionApplier, ActionOutcome, ApplyResult, FileSystemActionError};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use down::{down, ArtifactFailure, DownReport, DownStatus};
pub use error::{Result, SyncError};
pub use indexer::{ChangeSet, IndexResult, Indexer};
pub use options::{describe_options, find_option, OptionKind, OptionSpec};
pub use ordering::order_actions;
pub use reconciler::{reconcile, HistoryState, HistoryTracker, ReconcileOutcome};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{CycleEvent, CycleResult, FolderHandle, FolderScheduler, SyncDaemon, SyncRequest};
pub use status::{ls_remote, status, UnknownDatabase};
pub use storage::{LocalStorage, MemoryStorage, RemoteFileMeta, RemoteStorage, StorageError};
pub use transaction::{CleanupReport, RemoteTransaction, TransactionManager};
pub use up::{up, UpReport, UpStatus};
