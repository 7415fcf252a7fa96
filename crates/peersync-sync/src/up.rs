//! Up-sync: publish local changes as one new database version.

use std::path::PathBuf;

use peersync_chunk::DedupStats;
use peersync_meta::{
    encode_database_version, DatabaseVersion, DatabaseVersionHeader, MultiChunkEntry, RemoteFile,
    Timestamp,
};
use tracing::{info, instrument};

use crate::cancel::CancelToken;
use crate::context::SyncContext;
use crate::error::Result;
use crate::indexer::ChangeSet;
use crate::status::{ls_remote, UnknownDatabase};
use crate::transaction::CleanupReport;

/// How an up cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpStatus {
    /// A new database version was committed
    Uploaded {
        /// Header of the committed version
        header: DatabaseVersionHeader,
        /// Multichunks uploaded with it
        multichunks: usize,
    },
    /// Nothing changed locally
    NoChanges,
    /// Other clients published versions that must be applied first
    RemoteChangesPending {
        /// The unknown remote database files
        unknown: Vec<UnknownDatabase>,
    },
}

/// Result of an up cycle
#[derive(Debug, Clone)]
pub struct UpReport {
    /// Outcome
    pub status: UpStatus,
    /// Local changes found
    pub changes: ChangeSet,
    /// Chunking statistics
    pub stats: DedupStats,
    /// Recovery done before the cycle
    pub cleanup: CleanupReport,
}

impl UpReport {
    fn without_upload(status: UpStatus, cleanup: CleanupReport) -> Self {
        Self {
            status,
            changes: ChangeSet::default(),
            stats: DedupStats::default(),
            cleanup,
        }
    }
}

async fn remove_staged(paths: &[PathBuf]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// Index local changes and commit them in one remote transaction.
///
/// Refuses to upload while other clients have unknown database versions.
/// The new version is added to the local database only after the commit.
#[instrument(skip_all, fields(client = %ctx.client()))]
pub async fn up(ctx: &SyncContext, cancel: &CancelToken) -> Result<UpReport> {
    let cleanup = ctx.transactions().clean_transactions().await?;
    cancel.check()?;

    let unknown = ls_remote(ctx).await?;
    if !unknown.is_empty() {
        info!(unknown = unknown.len(), "remote changes must be applied before uploading");
        return Ok(UpReport::without_upload(UpStatus::RemoteChangesPending { unknown }, cleanup));
    }

    let index = ctx.indexer().index(ctx.deduper()?)?;
    if index.changes.is_empty() {
        info!("no local changes");
        return Ok(UpReport::without_upload(UpStatus::NoChanges, cleanup));
    }
    cancel.check()?;

    let db = ctx.database();
    let client = ctx.client();
    let mut clock = db.current_vector_clock()?;
    let sequence = db.high_water(client)?.max(clock.get(client)) + 1;
    clock.set(client, sequence);
    let header = DatabaseVersionHeader {
        client: client.to_string(),
        timestamp: Timestamp::now(),
        vector_clock: clock,
    };
    let mut version = DatabaseVersion::new(header.clone());
    version.file_histories = index.histories;
    version.file_contents = index.contents;
    version.multichunks = index
        .dedup
        .sealed
        .iter()
        .map(|m| MultiChunkEntry {
            id: m.id,
            chunks: m.entries.clone(),
        })
        .collect();

    let scratch = ctx.transactions().scratch();
    let mut staged = Vec::with_capacity(index.dedup.sealed.len() + 1);
    let mut tx = ctx.transactions().begin();
    for sealed in &index.dedup.sealed {
        let encoded = ctx.chain().encode(&sealed.bytes)?;
        let local = scratch.write("multichunk", &encoded).await?;
        tx.upload(local.clone(), RemoteFile::MultiChunk(sealed.id).name());
        staged.push(local);
    }
    let encoded = encode_database_version(&version, ctx.chain())?;
    let local = scratch.write("database", &encoded).await?;
    tx.upload(local.clone(), RemoteFile::database(client, sequence).name());
    staged.push(local);

    let committed = match cancel.check() {
        Ok(()) => tx.commit(cancel).await,
        Err(e) => Err(e),
    };
    remove_staged(&staged).await;
    committed?;

    db.add_database_version(version)?;
    let multichunks = index.dedup.sealed.len();
    info!(
        sequence,
        multichunks,
        changes = index.changes.len(),
        "database version uploaded"
    );
    Ok(UpReport {
        status: UpStatus::Uploaded { header, multichunks },
        changes: index.changes,
        stats: index.dedup.stats,
        cleanup,
    })
}
