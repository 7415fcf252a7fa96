//! Applies ordered filesystem actions to the local folder.
//!
//! Every action is applied on its own. A failure is recorded as a
//! [`FileSystemActionError`] in that action's outcome and the batch carries
//! on; nothing here aborts a cycle.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use peersync_chunk::FileChecksum;
use peersync_meta::{FileContent, FileType, FileVersion, Timestamp};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actions::FileSystemAction;
use crate::chunk_cache::ChunkCache;
use crate::fs::{disk_matches, to_system_time, LocalFileSystem};
use crate::reconciler::{HistoryState, HistoryTracker};

/// Per-action failure: permissions, locks, missing paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct FileSystemActionError {
    /// Path the action worked on
    pub path: String,
    /// Underlying I/O error kind
    pub kind: io::ErrorKind,
    /// Description
    pub message: String,
}

impl FileSystemActionError {
    fn new(path: &str, kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            kind,
            message: message.into(),
        }
    }

    fn io(path: &str, err: io::Error) -> Self {
        Self::new(path, err.kind(), err.to_string())
    }
}

/// What applying an action did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// The disk changed
    Applied,
    /// The disk already was in the requested state
    NoOp,
}

/// Result of one action
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// The action
    pub action: FileSystemAction,
    /// What happened
    pub result: Result<ApplyResult, FileSystemActionError>,
}

impl ActionOutcome {
    /// True if the action failed
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

/// Name for a conflict copy of `path`.
///
/// `docs/report.txt` becomes `docs/report (laptop conflicted copy 2024-03-01).txt`;
/// attempts after the first add a counter inside the parentheses.
pub fn conflict_name(path: &str, client: &str, suffix: &str, date: &str, is_folder: bool, attempt: u32) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && !is_folder => name.split_at(dot),
        _ => (name, ""),
    };
    let counter = if attempt > 1 {
        format!(" {}", attempt)
    } else {
        String::new()
    };
    let renamed = format!("{} ({} {} {}{}){}", stem, client, suffix, date, counter, ext);
    match dir {
        Some(dir) => format!("{}/{}", dir, renamed),
        None => renamed,
    }
}

/// Applies actions for one cycle
pub struct ActionApplier<'a> {
    fs: &'a dyn LocalFileSystem,
    root: &'a Path,
    cache: &'a ChunkCache,
    contents: &'a HashMap<FileChecksum, FileContent>,
    client: &'a str,
    conflict_suffix: &'a str,
}

impl<'a> ActionApplier<'a> {
    /// Applier writing below `root`, assembling files from `cache`
    pub fn new(
        fs: &'a dyn LocalFileSystem,
        root: &'a Path,
        cache: &'a ChunkCache,
        contents: &'a HashMap<FileChecksum, FileContent>,
        client: &'a str,
        conflict_suffix: &'a str,
    ) -> Self {
        Self {
            fs,
            root,
            cache,
            contents,
            client,
            conflict_suffix,
        }
    }

    /// Apply `actions` in order and move each history to its final state
    pub fn apply_all(&self, actions: Vec<FileSystemAction>, tracker: &mut HistoryTracker) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let result = self.apply(&action);
            let id = action.history_id();
            match &result {
                Ok(_) if matches!(action, FileSystemAction::Conflict { .. }) => {
                    tracker.advance(id, HistoryState::Conflicted);
                }
                Ok(r) => {
                    debug!(kind = action.kind(), path = action.path(), result = ?r, "action applied");
                }
                Err(e) => {
                    warn!(kind = action.kind(), error = %e, "action failed");
                    tracker.advance(id, HistoryState::Skipped);
                }
            }
            outcomes.push(ActionOutcome { action, result });
        }
        tracker.advance_all(HistoryState::ActionPlanned, HistoryState::Applied);
        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        info!(actions = outcomes.len(), failed, "filesystem actions applied");
        outcomes
    }

    fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Apply one action
    pub fn apply(&self, action: &FileSystemAction) -> Result<ApplyResult, FileSystemActionError> {
        match action {
            FileSystemAction::New { target } | FileSystemAction::Change { target, .. } => {
                self.materialize(target)
            }
            FileSystemAction::Rename { local, target } => self.rename(local, target),
            FileSystemAction::Delete { local } => self.delete(local),
            FileSystemAction::SetAttributes { target } => {
                let path = self.abs(&target.path);
                match self.fs.stat(&path).map_err(|e| FileSystemActionError::io(&target.path, e))? {
                    None => Err(FileSystemActionError::new(
                        &target.path,
                        io::ErrorKind::NotFound,
                        "entry vanished before its attributes were set",
                    )),
                    Some(_) => {
                        self.set_attributes(&path, target)?;
                        Ok(ApplyResult::Applied)
                    }
                }
            }
            FileSystemAction::Conflict { path, file_type, .. } => self.conflict(path, *file_type),
        }
    }

    fn set_attributes(&self, path: &Path, target: &FileVersion) -> Result<(), FileSystemActionError> {
        if target.file_type == FileType::Symlink {
            return Ok(());
        }
        if let Some(mode) = target.posix_permissions {
            self.fs
                .set_permissions(path, mode)
                .map_err(|e| FileSystemActionError::io(&target.path, e))?;
        }
        if target.file_type == FileType::File {
            self.fs
                .set_modified(path, to_system_time(target.last_modified))
                .map_err(|e| FileSystemActionError::io(&target.path, e))?;
        }
        Ok(())
    }

    fn ensure_parent(&self, path: &Path, rel: &str) -> Result<(), FileSystemActionError> {
        if let Some(parent) = path.parent() {
            self.fs
                .create_dir_all(parent)
                .map_err(|e| FileSystemActionError::io(rel, e))?;
        }
        Ok(())
    }

    /// Create or replace the entry at the target path
    fn materialize(&self, target: &FileVersion) -> Result<ApplyResult, FileSystemActionError> {
        let rel = target.path.as_str();
        let path = self.abs(rel);
        let existing = self.fs.stat(&path).map_err(|e| FileSystemActionError::io(rel, e))?;
        if let Some(entry) = &existing {
            let same = disk_matches(self.fs, &path, entry, target).map_err(|e| FileSystemActionError::io(rel, e))?;
            if same {
                if target.posix_permissions.is_some() && entry.permissions != target.posix_permissions {
                    self.set_attributes(&path, target)?;
                    return Ok(ApplyResult::Applied);
                }
                return Ok(ApplyResult::NoOp);
            }
        }
        self.ensure_parent(&path, rel)?;

        match target.file_type {
            FileType::Folder => {
                self.fs
                    .create_dir_all(&path)
                    .map_err(|e| FileSystemActionError::io(rel, e))?;
            }
            FileType::Symlink => {
                let link = target.link_target.as_deref().ok_or_else(|| {
                    FileSystemActionError::new(rel, io::ErrorKind::InvalidData, "symlink version without target")
                })?;
                if existing.is_some() {
                    self.fs
                        .remove_file(&path)
                        .map_err(|e| FileSystemActionError::io(rel, e))?;
                }
                self.fs
                    .symlink(link, &path)
                    .map_err(|e| FileSystemActionError::io(rel, e))?;
            }
            FileType::File => self.write_content(&path, target)?,
        }
        self.set_attributes(&path, target)?;
        Ok(ApplyResult::Applied)
    }

    fn write_content(&self, path: &Path, target: &FileVersion) -> Result<(), FileSystemActionError> {
        let rel = target.path.as_str();
        let checksum = target.checksum.ok_or_else(|| {
            FileSystemActionError::new(rel, io::ErrorKind::InvalidData, "file version without checksum")
        })?;
        let content = self.contents.get(&checksum).ok_or_else(|| {
            FileSystemActionError::new(
                rel,
                io::ErrorKind::NotFound,
                format!("content {} is unknown", checksum.to_hex()),
            )
        })?;
        let mut reader = self.cache.open_content(&content.chunks);
        self.fs
            .write_file(path, &mut reader)
            .map_err(|e| FileSystemActionError::io(rel, e))?;
        let written = self.fs.checksum(path).map_err(|e| FileSystemActionError::io(rel, e))?;
        if written != checksum {
            let _ = self.fs.remove_file(path);
            return Err(FileSystemActionError::new(
                rel,
                io::ErrorKind::InvalidData,
                "assembled file does not match its checksum",
            ));
        }
        Ok(())
    }

    fn rename(&self, local: &FileVersion, target: &FileVersion) -> Result<ApplyResult, FileSystemActionError> {
        let from = self.abs(&local.path);
        let to = self.abs(&target.path);
        if let Some(entry) = self.fs.stat(&to).map_err(|e| FileSystemActionError::io(&target.path, e))? {
            let done = disk_matches(self.fs, &to, &entry, target).map_err(|e| FileSystemActionError::io(&target.path, e))?;
            if done {
                return Ok(ApplyResult::NoOp);
            }
        }
        if self
            .fs
            .stat(&from)
            .map_err(|e| FileSystemActionError::io(&local.path, e))?
            .is_none()
        {
            return Err(FileSystemActionError::new(
                &local.path,
                io::ErrorKind::NotFound,
                "rename source is gone",
            ));
        }
        self.ensure_parent(&to, &target.path)?;
        self.fs
            .rename(&from, &to)
            .map_err(|e| FileSystemActionError::io(&target.path, e))?;
        self.set_attributes(&to, target)?;
        Ok(ApplyResult::Applied)
    }

    fn delete(&self, local: &FileVersion) -> Result<ApplyResult, FileSystemActionError> {
        let path = self.abs(&local.path);
        let Some(entry) = self.fs.stat(&path).map_err(|e| FileSystemActionError::io(&local.path, e))? else {
            return Ok(ApplyResult::NoOp);
        };
        let removed = if entry.file_type == FileType::Folder {
            self.fs.remove_dir(&path)
        } else {
            self.fs.remove_file(&path)
        };
        removed.map_err(|e| FileSystemActionError::io(&local.path, e))?;
        Ok(ApplyResult::Applied)
    }

    fn conflict(&self, rel: &str, file_type: FileType) -> Result<ApplyResult, FileSystemActionError> {
        let path = self.abs(rel);
        let Some(entry) = self.fs.stat(&path).map_err(|e| FileSystemActionError::io(rel, e))? else {
            return Ok(ApplyResult::NoOp);
        };
        let is_folder = entry.file_type == FileType::Folder || file_type == FileType::Folder;
        let date = Timestamp::now().date_string();
        for attempt in 1..=1000 {
            let name = conflict_name(rel, self.client, self.conflict_suffix, &date, is_folder, attempt);
            let dest = self.abs(&name);
            if self.fs.stat(&dest).map_err(|e| FileSystemActionError::io(&name, e))?.is_none() {
                self.fs
                    .rename(&path, &dest)
                    .map_err(|e| FileSystemActionError::io(rel, e))?;
                info!(path = rel, copy = %name, "local version kept as conflict copy");
                return Ok(ApplyResult::Applied);
            }
        }
        Err(FileSystemActionError::new(
            rel,
            io::ErrorKind::AlreadyExists,
            "no free conflict copy name",
        ))
    }
}
