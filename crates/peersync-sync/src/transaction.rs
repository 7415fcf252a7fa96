//! Transactional remote writes.
//!
//! A transaction makes a set of uploads and deletions visible together:
//!
//! 1. upload a manifest `tx-<client>-<id>` listing every action
//! 2. upload each new file to a `temp-` name, move each deleted file to a `temp-` name
//! 3. move every staged upload to its final name
//! 4. delete the manifest (the commit point)
//! 5. delete the temp copies of deleted files
//!
//! While a manifest exists, [`TransactionManager::list`] hides the final names
//! of its uploads and still shows the files it deletes, and
//! [`TransactionManager::download`] falls back to the temp copy of a deleted
//! file. A crash before step 4 is undone by
//! [`TransactionManager::clean_transactions`], which runs on every connect.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use peersync_chunk::TransformChain;
use peersync_meta::{ClientId, RemoteFile, TEMP_PREFIX, TRANSACTION_PREFIX};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, SyncError};
use crate::retry::RetryExecutor;
use crate::storage::{RemoteFileMeta, RemoteStorage, Scratch, StorageError};

/// One step recorded in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransactionAction {
    /// Upload a local file under `final_name`, staged as `temp_name`
    Upload {
        /// Local source file
        local: PathBuf,
        /// Name after commit
        final_name: String,
        /// Staging name
        temp_name: String,
    },
    /// Delete `final_name`, parked as `temp_name` until commit
    Delete {
        /// Name being deleted
        final_name: String,
        /// Parking name
        temp_name: String,
    },
}

/// Remote manifest of a pending transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionManifest {
    /// Client running the transaction
    pub client: ClientId,
    /// Actions in commit order
    pub actions: Vec<TransactionAction>,
}

impl TransactionManifest {
    fn has_deletions(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, TransactionAction::Delete { .. }))
    }

    fn temp_names(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|a| match a {
            TransactionAction::Upload { temp_name, .. } | TransactionAction::Delete { temp_name, .. } => {
                temp_name.as_str()
            }
        })
    }
}

/// Result of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Own manifests rolled back
    pub rolled_back: Vec<String>,
    /// Unreferenced temp files removed
    pub removed_temps: Vec<String>,
}

/// Transaction-aware access to remote storage for one client.
pub struct TransactionManager {
    storage: Arc<dyn RemoteStorage>,
    chain: TransformChain,
    scratch: Scratch,
    client: ClientId,
    retry: RetryExecutor,
}

impl TransactionManager {
    /// Manager for `client`; manifests go through `chain`
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        chain: TransformChain,
        scratch: Scratch,
        client: impl Into<ClientId>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            storage,
            chain,
            scratch,
            client: client.into(),
            retry,
        }
    }

    /// Underlying storage
    pub fn storage(&self) -> &dyn RemoteStorage {
        self.storage.as_ref()
    }

    /// Scratch directory used for transfers
    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    /// Start an empty transaction
    pub fn begin(&self) -> RemoteTransaction<'_> {
        RemoteTransaction {
            manager: self,
            manifest_name: RemoteFile::new_transaction(&self.client).name(),
            actions: Vec::new(),
        }
    }

    fn encode_manifest(&self, manifest: &TransactionManifest) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(manifest).map_err(|e| SyncError::Format {
            artifact: "transaction manifest".into(),
            reason: e.to_string(),
        })?;
        Ok(self.chain.encode(&json)?)
    }

    fn decode_manifest(&self, name: &str, bytes: &[u8]) -> Result<TransactionManifest> {
        let json = self
            .chain
            .decode(bytes)
            .map_err(|e| SyncError::decode(name, e))?;
        serde_json::from_slice(&json).map_err(|e| SyncError::decode(name, e))
    }

    /// Every manifest currently in the repository that can be decoded
    pub async fn pending_manifests(&self) -> Result<Vec<(String, TransactionManifest)>> {
        let names = self.storage.list(TRANSACTION_PREFIX).await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names.into_keys() {
            let bytes = match self.read_with_retry(&name).await {
                Ok(bytes) => bytes,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            match self.decode_manifest(&name, &bytes) {
                Ok(manifest) => out.push((name, manifest)),
                Err(e) => warn!(manifest = %name, error = %e, "skipping unreadable transaction manifest"),
            }
        }
        Ok(out)
    }

    async fn read_with_retry(&self, name: &str) -> std::result::Result<Vec<u8>, StorageError> {
        self.retry
            .execute(name, || self.scratch.download(self.storage.as_ref(), name))
            .await
            .into_result()
    }

    /// List `prefix` as seen after every pending transaction rolls back
    pub async fn list(&self, prefix: &str) -> Result<BTreeMap<String, RemoteFileMeta>> {
        let mut files = self.storage.list(prefix).await?;
        let manifests = self.pending_manifests().await?;
        let temps = if manifests.iter().any(|(_, m)| m.has_deletions()) {
            self.storage.list(TEMP_PREFIX).await?
        } else {
            BTreeMap::new()
        };
        for (_, manifest) in &manifests {
            for action in &manifest.actions {
                match action {
                    TransactionAction::Upload { final_name, .. } => {
                        files.remove(final_name);
                    }
                    TransactionAction::Delete {
                        final_name,
                        temp_name,
                    } => {
                        if final_name.starts_with(prefix) && !files.contains_key(final_name) {
                            if let Some(temp) = temps.get(temp_name) {
                                files.insert(
                                    final_name.clone(),
                                    RemoteFileMeta {
                                        name: final_name.clone(),
                                        size: temp.size,
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(files)
    }

    /// Download `name` into `local`, retrying transient failures and falling
    /// back to the parked copy of a file a pending transaction is deleting
    pub async fn download(&self, name: &str, local: &Path) -> Result<()> {
        let first = self
            .retry
            .execute(name, || self.storage.download(name, local))
            .await
            .into_result();
        match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                for (_, manifest) in self.pending_manifests().await? {
                    for action in &manifest.actions {
                        if let TransactionAction::Delete {
                            final_name,
                            temp_name,
                        } = action
                        {
                            if final_name == name {
                                debug!(name, temp = %temp_name, "reading parked copy of deleted file");
                                self.retry
                                    .execute(temp_name, || self.storage.download(temp_name, local))
                                    .await
                                    .into_result()?;
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// [`download`](Self::download) through a scratch file
    pub async fn download_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.scratch.file("download");
        let result = self.download(name, &path).await;
        let bytes = match result {
            Ok(()) => tokio::fs::read(&path).await.map_err(SyncError::from),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&path).await;
        bytes
    }

    /// Recovery pass: roll back this client's unfinished transactions, remove
    /// temp files no manifest references, and refuse to continue while
    /// another client has a pending transaction that deletes files.
    #[instrument(skip(self), fields(client = %self.client))]
    pub async fn clean_transactions(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let mut referenced = BTreeSet::new();
        let mut blocking = BTreeSet::new();

        for (name, manifest) in self.pending_manifests().await? {
            let owner = match RemoteFile::parse(&name) {
                Ok(RemoteFile::Transaction { client, .. }) => client,
                _ => manifest.client.clone(),
            };
            if owner == self.client {
                warn!(manifest = %name, actions = manifest.actions.len(), "rolling back unfinished transaction");
                self.rollback(&name, &manifest.actions).await?;
                report.rolled_back.push(name);
            } else {
                referenced.extend(manifest.temp_names().map(str::to_string));
                if manifest.has_deletions() {
                    blocking.insert(owner);
                }
            }
        }

        for temp in self.storage.list(TEMP_PREFIX).await?.into_keys() {
            if !referenced.contains(&temp) {
                self.storage.delete(&temp).await?;
                report.removed_temps.push(temp);
            }
        }

        if !report.rolled_back.is_empty() || !report.removed_temps.is_empty() {
            info!(
                rolled_back = report.rolled_back.len(),
                removed_temps = report.removed_temps.len(),
                "remote repository cleaned"
            );
        }
        if !blocking.is_empty() {
            return Err(SyncError::BlockingTransactions {
                clients: blocking.into_iter().collect(),
            });
        }
        Ok(report)
    }

    async fn rollback(&self, manifest_name: &str, actions: &[TransactionAction]) -> Result<()> {
        for action in actions {
            match action {
                TransactionAction::Upload {
                    final_name,
                    temp_name,
                    ..
                } => {
                    self.storage.delete(temp_name).await?;
                    self.storage.delete(final_name).await?;
                }
                TransactionAction::Delete {
                    final_name,
                    temp_name,
                } => match self.storage.move_file(temp_name, final_name).await {
                    Ok(()) => debug!(file = %final_name, "restored file parked for deletion"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        self.storage.delete(manifest_name).await?;
        Ok(())
    }
}

/// A transaction being assembled and committed.
pub struct RemoteTransaction<'a> {
    manager: &'a TransactionManager,
    manifest_name: String,
    actions: Vec<TransactionAction>,
}

impl<'a> RemoteTransaction<'a> {
    /// Stage a local file for upload as `final_name`
    pub fn upload(&mut self, local: impl Into<PathBuf>, final_name: impl Into<String>) {
        self.actions.push(TransactionAction::Upload {
            local: local.into(),
            final_name: final_name.into(),
            temp_name: RemoteFile::new_temp(&self.manager.client).name(),
        });
    }

    /// Stage the deletion of `final_name`
    pub fn delete(&mut self, final_name: impl Into<String>) {
        self.actions.push(TransactionAction::Delete {
            final_name: final_name.into(),
            temp_name: RemoteFile::new_temp(&self.manager.client).name(),
        });
    }

    /// Manifest name of this transaction
    pub fn name(&self) -> &str {
        &self.manifest_name
    }

    /// Recorded actions
    pub fn actions(&self) -> &[TransactionAction] {
        &self.actions
    }

    /// True if nothing was staged
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Commit every staged action, or roll all of them back and fail.
    #[instrument(skip(self, cancel), fields(transaction = %self.manifest_name, actions = self.actions.len()))]
    pub async fn commit(self, cancel: &CancelToken) -> Result<()> {
        if self.actions.is_empty() {
            return Ok(());
        }
        match self.run(cancel).await {
            Ok(()) => {
                info!("transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "transaction failed, rolling back");
                if let Err(rollback) = self
                    .manager
                    .rollback(&self.manifest_name, &self.actions)
                    .await
                {
                    warn!(error = %rollback, "rollback incomplete, next connect will clean up");
                }
                Err(match e {
                    SyncError::Cancelled => SyncError::Cancelled,
                    other => SyncError::Transaction {
                        transaction: self.manifest_name.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    async fn run(&self, cancel: &CancelToken) -> Result<()> {
        let m = self.manager;
        let manifest = TransactionManifest {
            client: m.client.clone(),
            actions: self.actions.clone(),
        };
        let bytes = m.encode_manifest(&manifest)?;
        let local = m.scratch.write("manifest", &bytes).await?;
        let uploaded = m
            .retry
            .execute(&self.manifest_name, || m.storage.upload(&local, &self.manifest_name))
            .await
            .into_result();
        let _ = tokio::fs::remove_file(&local).await;
        uploaded?;

        for action in &self.actions {
            cancel.check()?;
            match action {
                TransactionAction::Upload {
                    local, temp_name, ..
                } => {
                    m.retry
                        .execute(temp_name, || m.storage.upload(local, temp_name))
                        .await
                        .into_result()?;
                }
                TransactionAction::Delete {
                    final_name,
                    temp_name,
                } => match m.storage.move_file(final_name, temp_name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(file = %final_name, "file to delete is already gone");
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
        cancel.check()?;

        for action in &self.actions {
            if let TransactionAction::Upload {
                final_name,
                temp_name,
                ..
            } = action
            {
                m.storage.move_file(temp_name, final_name).await?;
            }
        }

        m.storage.delete(&self.manifest_name).await?;

        for action in &self.actions {
            if let TransactionAction::Delete { temp_name, .. } = action {
                if let Err(e) = m.storage.delete(temp_name).await {
                    warn!(temp = %temp_name, error = %e, "could not remove parked file, next connect will");
                }
            }
        }
        Ok(())
    }
}
