//! Per-folder sync context.
//!
//! Owns everything one managed folder needs for a cycle: configuration,
//! local database, transform chain, transaction layer over the remote
//! storage, local filesystem and chunk cache. Nothing is shared between
//! folders.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use peersync_chunk::{Deduper, TransformChain};
use peersync_meta::{Database, HeaderComparator};
use tracing::{info, instrument};

use crate::chunk_cache::ChunkCache;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::fs::{LocalFileSystem, StdFileSystem};
use crate::indexer::Indexer;
use crate::retry::RetryExecutor;
use crate::storage::{RemoteStorage, Scratch};
use crate::transaction::TransactionManager;

/// Subdirectory of the state directory holding the database
pub const DATABASE_DIR: &str = "db";
/// Subdirectory of the state directory holding cached chunks
pub const CACHE_DIR: &str = "cache";
/// Subdirectory of the state directory holding transfer scratch files
pub const SCRATCH_DIR: &str = "tmp";

/// State of one managed folder
pub struct SyncContext {
    config: SyncConfig,
    state_dir: PathBuf,
    db: Database,
    chain: TransformChain,
    transactions: TransactionManager,
    fs: Arc<dyn LocalFileSystem>,
    comparator: HeaderComparator,
    cache: ChunkCache,
    retry: RetryExecutor,
}

impl SyncContext {
    /// Open the folder described by `config` against `storage`
    pub fn open(config: SyncConfig, storage: Arc<dyn RemoteStorage>) -> Result<Self> {
        Self::with_file_system(config, storage, Arc::new(StdFileSystem))
    }

    /// Open with a custom local filesystem implementation
    #[instrument(skip_all, fields(client = %config.client_id, folder = %config.local_dir.display()))]
    pub fn with_file_system(
        config: SyncConfig,
        storage: Arc<dyn RemoteStorage>,
        fs: Arc<dyn LocalFileSystem>,
    ) -> Result<Self> {
        config.validate()?;
        fs.create_dir_all(&config.local_dir)?;
        let state_dir = config.state_dir();
        fs.create_dir_all(&state_dir)?;

        let db = Database::open(state_dir.join(DATABASE_DIR))?;
        let chain = config.transform_chain()?;
        let retry = RetryExecutor::new(config.retry_config());

        // leftovers of an interrupted transfer
        let scratch_dir = state_dir.join(SCRATCH_DIR);
        if scratch_dir.exists() {
            std::fs::remove_dir_all(&scratch_dir)?;
        }
        let scratch = Scratch::new(scratch_dir)?;
        let cache = ChunkCache::new(state_dir.join(CACHE_DIR))?;
        let transactions = TransactionManager::new(
            storage,
            chain.clone(),
            scratch,
            config.client_id.clone(),
            retry.clone(),
        );
        let comparator = config.comparator();
        info!(
            versions = db.version_count()?,
            transforms = chain.steps().len(),
            "sync context opened"
        );
        Ok(Self {
            config,
            state_dir,
            db,
            chain,
            transactions,
            fs,
            comparator,
            cache,
            retry,
        })
    }

    /// Folder configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// This client's id
    pub fn client(&self) -> &str {
        &self.config.client_id
    }

    /// The synced folder
    pub fn local_dir(&self) -> &Path {
        &self.config.local_dir
    }

    /// State directory (database, cache, scratch)
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Local database
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Transform chain for remote artifacts
    pub fn chain(&self) -> &TransformChain {
        &self.chain
    }

    /// Transaction-aware remote access
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Local filesystem
    pub fn file_system(&self) -> &dyn LocalFileSystem {
        self.fs.as_ref()
    }

    /// Header ordering in use
    pub fn comparator(&self) -> &HeaderComparator {
        &self.comparator
    }

    /// Chunk cache
    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    /// Retry policy for remote reads
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Indexer over the folder and database
    pub fn indexer(&self) -> Indexer<'_> {
        Indexer::new(self.fs.as_ref(), &self.config.local_dir, &self.state_dir, &self.db)
    }

    /// A fresh deduper with the configured chunker and packer
    pub fn deduper(&self) -> Result<Deduper> {
        Ok(Deduper::new(self.config.chunker()?, self.config.packer_config()))
    }
}
