//! Down-sync: fetch other clients' database versions, pick the winning
//! branch and bring the folder to its state.
//!
//! Phases, each checked for cancellation:
//!
//! 1. recover pending transactions, list unknown database files
//! 2. download and decode them; a corrupt file is reported and excludes
//!    that client's later versions and every version built on it
//! 3. reconcile the local branch against the remote branches
//! 4. plan and order filesystem actions
//! 5. fetch the multichunks holding the needed chunks into the cache
//! 6. remotely delete this client's losing database files
//! 7. apply the actions, recording per-action failures
//! 8. drop the losing versions from the local database and add the winners,
//!    then remember every listed database file so it is not analysed again

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;

use peersync_chunk::{ChunkChecksum, FileChecksum, MultiChunkId, MultiChunkReader};
use peersync_meta::{
    decode_database_version, Database, DatabaseVersion, DatabaseVersionHeader, FileContent,
    FileType, RemoteFile,
};
use tracing::{debug, info, instrument, warn};

use crate::actions::{plan_actions, FileSystemAction, PlanInput};
use crate::apply::{ActionApplier, ActionOutcome, FileSystemActionError};
use crate::cancel::CancelToken;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::ordering::order_actions;
use crate::reconciler::{reconcile, HistoryState, HistoryTracker};
use crate::status::{ls_remote, UnknownDatabase};
use crate::transaction::CleanupReport;

/// How a down cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownStatus {
    /// No unknown remote versions could be used
    NoRemoteChanges,
    /// Reconciliation ran
    Reconciled {
        /// Client whose branch won
        winner: String,
    },
}

/// A remote artifact that could not be used
#[derive(Debug)]
pub struct ArtifactFailure {
    /// Remote file name
    pub name: String,
    /// Why it was rejected
    pub error: SyncError,
}

/// Result of a down cycle
#[derive(Debug)]
pub struct DownReport {
    /// Outcome
    pub status: DownStatus,
    /// Versions added to the local database, in order
    pub applied: Vec<DatabaseVersionHeader>,
    /// Local versions removed because they lost
    pub pruned: Vec<DatabaseVersionHeader>,
    /// Every filesystem action and its result
    pub outcomes: Vec<ActionOutcome>,
    /// Remote database files rejected as corrupt or malformed
    pub failed_artifacts: Vec<ArtifactFailure>,
    /// Final state count of every touched file history
    pub histories: BTreeMap<HistoryState, usize>,
    /// Recovery done before the cycle
    pub cleanup: CleanupReport,
}

impl DownReport {
    fn unchanged(cleanup: CleanupReport, failed_artifacts: Vec<ArtifactFailure>) -> Self {
        Self {
            status: DownStatus::NoRemoteChanges,
            applied: Vec::new(),
            pruned: Vec::new(),
            outcomes: Vec::new(),
            failed_artifacts,
            histories: BTreeMap::new(),
            cleanup,
        }
    }

    /// Failed filesystem actions
    pub fn action_failures(&self) -> impl Iterator<Item = &FileSystemActionError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    /// True if some action or artifact failed
    pub fn is_partial(&self) -> bool {
        !self.failed_artifacts.is_empty() || self.action_failures().next().is_some()
    }
}

fn decode_version(ctx: &SyncContext, file: &UnknownDatabase, bytes: &[u8]) -> Result<DatabaseVersion> {
    let version = decode_database_version(bytes, ctx.chain()).map_err(|e| SyncError::decode(&file.name, e))?;
    if version.header.client != file.client || version.header.sequence() != file.sequence {
        return Err(SyncError::Format {
            artifact: file.name.clone(),
            reason: format!("header {} does not match the file name", version.header),
        });
    }
    Ok(version)
}

async fn fetch_database_versions(
    ctx: &SyncContext,
    unknown: &[UnknownDatabase],
    cancel: &CancelToken,
) -> Result<(Vec<DatabaseVersion>, Vec<ArtifactFailure>)> {
    let mut versions = Vec::with_capacity(unknown.len());
    let mut failed = Vec::new();
    // client -> first rejected sequence
    let mut broken: BTreeMap<String, u64> = BTreeMap::new();
    for file in unknown {
        cancel.check()?;
        if broken.contains_key(&file.client) {
            debug!(name = %file.name, "skipping version after a rejected one");
            continue;
        }
        let bytes = ctx.transactions().download_bytes(&file.name).await?;
        match decode_version(ctx, file, &bytes) {
            Ok(version) => versions.push(version),
            Err(e @ (SyncError::Integrity { .. } | SyncError::Format { .. })) => {
                warn!(name = %file.name, error = %e, "rejecting remote database file");
                broken.insert(file.client.clone(), file.sequence);
                failed.push(ArtifactFailure {
                    name: file.name.clone(),
                    error: e,
                });
            }
            Err(e) => return Err(e),
        }
    }
    versions.retain(|v| {
        broken
            .iter()
            .all(|(client, seq)| v.header.vector_clock.get(client) < *seq)
    });
    Ok((versions, failed))
}

fn file_target(action: &FileSystemAction) -> Option<FileChecksum> {
    match action {
        FileSystemAction::New { target } | FileSystemAction::Change { target, .. }
            if target.file_type == FileType::File =>
        {
            target.checksum
        }
        _ => None,
    }
}

fn gather_contents(
    db: &Database,
    applied: &[DatabaseVersion],
    actions: &[FileSystemAction],
) -> Result<HashMap<FileChecksum, FileContent>> {
    let fresh: HashMap<FileChecksum, &FileContent> = applied
        .iter()
        .flat_map(|v| v.file_contents.iter())
        .map(|c| (c.checksum, c))
        .collect();
    let mut contents = HashMap::new();
    for checksum in actions.iter().filter_map(file_target) {
        if contents.contains_key(&checksum) {
            continue;
        }
        let content = match fresh.get(&checksum) {
            Some(c) => Some((*c).clone()),
            None => db.content_chunks(&checksum)?,
        };
        match content {
            Some(c) => {
                contents.insert(checksum, c);
            }
            None => warn!(content = %checksum, "no chunk list for file content"),
        }
    }
    Ok(contents)
}

async fn fetch_chunks(
    ctx: &SyncContext,
    applied: &[DatabaseVersion],
    contents: &HashMap<FileChecksum, FileContent>,
    cancel: &CancelToken,
) -> Result<usize> {
    let fresh: HashMap<ChunkChecksum, MultiChunkId> = applied
        .iter()
        .flat_map(|v| v.multichunks.iter())
        .flat_map(|m| m.chunks.iter().map(move |c| (c.checksum, m.id)))
        .collect();
    let mut needed: BTreeSet<MultiChunkId> = BTreeSet::new();
    for content in contents.values() {
        for chunk in &content.chunks {
            if ctx.cache().contains(chunk) {
                continue;
            }
            let location = match fresh.get(chunk) {
                Some(id) => Some(*id),
                None => ctx.database().chunk_location(chunk)?.map(|l| l.multichunk_id),
            };
            match location {
                Some(id) => {
                    needed.insert(id);
                }
                None => warn!(chunk = %chunk, "chunk has no known multichunk"),
            }
        }
    }

    for id in &needed {
        cancel.check()?;
        let name = RemoteFile::MultiChunk(*id).name();
        let bytes = ctx.transactions().download_bytes(&name).await?;
        let plain = ctx.chain().decode(&bytes).map_err(|e| SyncError::decode(&name, e))?;
        let mut reader = MultiChunkReader::open(plain.as_slice()).map_err(|e| SyncError::decode(&name, e))?;
        if reader.id() != *id {
            return Err(SyncError::Format {
                artifact: name,
                reason: format!("container holds multichunk {}", reader.id()),
            });
        }
        let chunks = reader.read_all().map_err(|e| SyncError::decode(&name, e))?;
        for chunk in &chunks {
            ctx.cache().put(chunk).map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => SyncError::Integrity {
                    artifact: name.clone(),
                    reason: e.to_string(),
                },
                _ => SyncError::Io(e),
            })?;
        }
        debug!(multichunk = %name, chunks = chunks.len(), "multichunk unpacked");
    }
    Ok(needed.len())
}

/// Apply other clients' changes to the folder.
///
/// Transport failures and integrity failures of needed multichunks end the
/// cycle before the folder is touched. Per-action failures are recorded in
/// the report and do not end the cycle.
#[instrument(skip_all, fields(client = %ctx.client()))]
pub async fn down(ctx: &SyncContext, cancel: &CancelToken) -> Result<DownReport> {
    let cleanup = ctx.transactions().clean_transactions().await?;
    cancel.check()?;

    let unknown = ls_remote(ctx).await?;
    if unknown.is_empty() {
        debug!("no unknown remote versions");
        return Ok(DownReport::unchanged(cleanup, Vec::new()));
    }
    let (downloaded, failed) = fetch_database_versions(ctx, &unknown, cancel).await?;
    let db = ctx.database();
    let mut fresh = Vec::with_capacity(downloaded.len());
    for version in downloaded {
        if !db.contains_header(&version.header)? {
            fresh.push(version);
        }
    }
    let analysed: Vec<String> = unknown.iter().map(|u| u.name.clone()).collect();
    if fresh.is_empty() {
        db.add_known_database_files(&analysed)?;
        return Ok(DownReport::unchanged(cleanup, failed));
    }
    cancel.check()?;

    let client = ctx.client();
    let local_headers = db.local_branch(ctx.comparator())?;
    let remote_headers: Vec<DatabaseVersionHeader> = fresh.iter().map(|v| v.header.clone()).collect();
    let outcome = reconcile(client, &local_headers, &remote_headers, ctx.comparator())?;

    let pruned: Vec<DatabaseVersion> = db
        .database_versions()?
        .into_iter()
        .filter(|v| outcome.prune.contains(&v.header))
        .collect();
    let mut by_header: HashMap<DatabaseVersionHeader, DatabaseVersion> =
        fresh.into_iter().map(|v| (v.header.clone(), v)).collect();
    let applied = outcome
        .apply
        .iter()
        .map(|h| {
            by_header.remove(h).ok_or_else(|| SyncError::ConflictResolution {
                reason: format!("winning version {} was not downloaded", h),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let histories = db.file_histories_with_versions()?;
    let mut tracker = HistoryTracker::new();
    let input = PlanInput {
        local_client: client,
        histories: &histories,
        pruned: &pruned,
        applied: &applied,
    };
    let actions = order_actions(plan_actions(&input, ctx.file_system(), ctx.local_dir(), &mut tracker)?);
    let contents = gather_contents(db, &applied, &actions)?;
    let multichunks = fetch_chunks(ctx, &applied, &contents, cancel).await?;
    cancel.check()?;

    let own_pruned: Vec<&DatabaseVersionHeader> = outcome.pruned_of(client).collect();
    if !own_pruned.is_empty() {
        let mut tx = ctx.transactions().begin();
        for header in &own_pruned {
            tx.delete(RemoteFile::database(client, header.sequence()).name());
        }
        tx.commit(cancel).await?;
        info!(versions = own_pruned.len(), "losing database files deleted remotely");
    }

    let applier = ActionApplier::new(
        ctx.file_system(),
        ctx.local_dir(),
        ctx.cache(),
        &contents,
        client,
        &ctx.config().conflict_suffix,
    );
    let outcomes = applier.apply_all(actions, &mut tracker);

    db.remove_database_versions(&outcome.prune)?;
    for version in applied {
        db.add_database_version(version)?;
    }
    db.add_known_database_files(&analysed)?;

    let report = DownReport {
        status: DownStatus::Reconciled {
            winner: outcome.winner_client.clone(),
        },
        applied: outcome.apply,
        pruned: outcome.prune,
        outcomes,
        failed_artifacts: failed,
        histories: tracker.summary(),
        cleanup,
    };
    info!(
        winner = %outcome.winner_client,
        applied = report.applied.len(),
        pruned = report.pruned.len(),
        actions = report.outcomes.len(),
        failed_actions = report.action_failures().count(),
        multichunks,
        "down cycle finished"
    );
    Ok(report)
}
