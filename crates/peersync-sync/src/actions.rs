//! Filesystem actions that move the local folder to the reconciled state.
//!
//! For every file history touched by the cycle the planner compares three
//! states: the version the local database says is on disk (`expected`), the
//! version the winning branch ends with (`target`), and what is actually on
//! disk. Local changes that the database does not know about yet are never
//! overwritten; they are moved aside as conflict copies or left alone for the
//! next up-sync to pick up.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use peersync_meta::{DatabaseVersion, FileHistoryId, FileType, FileVersion, PartialFileHistory};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::fs::{disk_matches, DiskEntry, LocalFileSystem};
use crate::reconciler::{HistoryState, HistoryTracker};

/// One step against the local folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSystemAction {
    /// Create a file, folder or symlink
    New {
        /// Version to create
        target: FileVersion,
    },
    /// Replace the content of an existing entry
    Change {
        /// Version currently on disk
        local: FileVersion,
        /// Version to write
        target: FileVersion,
    },
    /// Move an entry to the target path and apply its attributes
    Rename {
        /// Version currently on disk
        local: FileVersion,
        /// Version at its new path
        target: FileVersion,
    },
    /// Remove an entry
    Delete {
        /// Version currently on disk
        local: FileVersion,
    },
    /// Update permission bits only
    SetAttributes {
        /// Version carrying the new attributes
        target: FileVersion,
    },
    /// Move whatever occupies `path` to a conflict copy name
    Conflict {
        /// History whose target needs the path
        history_id: FileHistoryId,
        /// Occupied path
        path: String,
        /// Kind of the entry found there
        file_type: FileType,
    },
}

impl FileSystemAction {
    /// Path the action works on; the destination for renames
    pub fn path(&self) -> &str {
        match self {
            FileSystemAction::New { target }
            | FileSystemAction::Change { target, .. }
            | FileSystemAction::Rename { target, .. }
            | FileSystemAction::SetAttributes { target } => &target.path,
            FileSystemAction::Delete { local } => &local.path,
            FileSystemAction::Conflict { path, .. } => path,
        }
    }

    /// Kind of entry the action creates, changes or removes
    pub fn file_type(&self) -> FileType {
        match self {
            FileSystemAction::New { target }
            | FileSystemAction::Change { target, .. }
            | FileSystemAction::Rename { target, .. }
            | FileSystemAction::SetAttributes { target } => target.file_type,
            FileSystemAction::Delete { local } => local.file_type,
            FileSystemAction::Conflict { file_type, .. } => *file_type,
        }
    }

    /// History the action belongs to
    pub fn history_id(&self) -> FileHistoryId {
        match self {
            FileSystemAction::New { target }
            | FileSystemAction::Change { target, .. }
            | FileSystemAction::Rename { target, .. }
            | FileSystemAction::SetAttributes { target } => target.history_id,
            FileSystemAction::Delete { local } => local.history_id,
            FileSystemAction::Conflict { history_id, .. } => *history_id,
        }
    }

    /// Short name for logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            FileSystemAction::New { .. } => "new",
            FileSystemAction::Change { .. } => "change",
            FileSystemAction::Rename { .. } => "rename",
            FileSystemAction::Delete { .. } => "delete",
            FileSystemAction::SetAttributes { .. } => "set-attributes",
            FileSystemAction::Conflict { .. } => "conflict",
        }
    }
}

/// Database changes the planner works from
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    /// This client
    pub local_client: &'a str,
    /// Every history in the local database before the cycle
    pub histories: &'a BTreeMap<FileHistoryId, PartialFileHistory>,
    /// Local versions that lost reconciliation
    pub pruned: &'a [DatabaseVersion],
    /// Winning versions to apply, in order
    pub applied: &'a [DatabaseVersion],
}

/// Expected and target version of one touched history
#[derive(Debug, Clone)]
struct HistoryPlan {
    id: FileHistoryId,
    expected: Option<FileVersion>,
    target: Option<FileVersion>,
}

fn live(v: &Option<FileVersion>) -> Option<&FileVersion> {
    v.as_ref().filter(|v| !v.is_deleted())
}

fn version_keys(versions: &[DatabaseVersion]) -> HashSet<(FileHistoryId, u64)> {
    versions
        .iter()
        .flat_map(|dv| dv.file_histories.iter())
        .flat_map(|h| h.versions.keys().map(move |v| (h.id, *v)))
        .collect()
}

/// Expected and target version of every history the cycle touches.
///
/// Histories changed only by this client's own losing versions are left out;
/// the disk keeps those changes and the next up-sync records them again.
fn history_plans(input: &PlanInput<'_>) -> Vec<HistoryPlan> {
    let own_pruned: Vec<DatabaseVersion> = input
        .pruned
        .iter()
        .filter(|v| v.header.client == input.local_client)
        .cloned()
        .collect();
    let own_pruned_keys = version_keys(&own_pruned);
    let all_pruned_keys = version_keys(input.pruned);

    let mut touched: BTreeSet<FileHistoryId> = BTreeSet::new();
    for dv in input.applied {
        touched.extend(dv.file_histories.iter().map(|h| h.id));
    }
    for dv in input.pruned.iter().filter(|v| v.header.client != input.local_client) {
        touched.extend(dv.file_histories.iter().map(|h| h.id));
    }

    touched
        .into_iter()
        .map(|id| {
            let base = input.histories.get(&id);
            let expected = base.and_then(|h| {
                h.versions
                    .values()
                    .filter(|v| !own_pruned_keys.contains(&(id, v.version)))
                    .next_back()
                    .cloned()
            });
            let mut target_versions: BTreeMap<u64, FileVersion> = base
                .map(|h| {
                    h.versions
                        .iter()
                        .filter(|(n, _)| !all_pruned_keys.contains(&(id, **n)))
                        .map(|(n, v)| (*n, v.clone()))
                        .collect()
                })
                .unwrap_or_default();
            for dv in input.applied {
                for h in dv.file_histories.iter().filter(|h| h.id == id) {
                    target_versions.extend(h.versions.iter().map(|(n, v)| (*n, v.clone())));
                }
            }
            HistoryPlan {
                id,
                expected,
                target: target_versions.into_values().next_back(),
            }
        })
        .collect()
}

/// Filesystem view used while planning
struct Disk<'a> {
    fs: &'a dyn LocalFileSystem,
    root: &'a Path,
}

impl Disk<'_> {
    fn stat(&self, path: &str) -> Result<Option<DiskEntry>> {
        Ok(self.fs.stat(&self.root.join(path))?)
    }

    fn matches(&self, path: &str, entry: &DiskEntry, version: &FileVersion) -> Result<bool> {
        Ok(disk_matches(self.fs, &self.root.join(path), entry, version)?)
    }
}

/// What occupies a target path
enum Occupant {
    Free,
    AlreadyTarget,
    Other(FileType),
}

/// Plan the actions that bring the disk to the winning state.
///
/// Returns actions in plan order; use [`crate::ordering::order_actions`]
/// before applying them.
#[instrument(skip_all, fields(applied = input.applied.len(), pruned = input.pruned.len()))]
pub fn plan_actions(
    input: &PlanInput<'_>,
    fs: &dyn LocalFileSystem,
    root: &Path,
    tracker: &mut HistoryTracker,
) -> Result<Vec<FileSystemAction>> {
    let disk = Disk { fs, root };
    let plans = history_plans(input);

    // paths that a delete in this batch frees up
    let mut freed: HashSet<String> = HashSet::new();
    let mut expected_on_disk: Vec<Option<DiskEntry>> = Vec::with_capacity(plans.len());
    let mut matches_expected: Vec<bool> = Vec::with_capacity(plans.len());
    for plan in &plans {
        tracker.advance(plan.id, HistoryState::Candidate);
        let (entry, matches) = match live(&plan.expected) {
            Some(e) => {
                let entry = disk.stat(&e.path)?;
                let matches = match &entry {
                    Some(entry) => disk.matches(&e.path, entry, e)?,
                    None => false,
                };
                (entry, matches)
            }
            None => (None, false),
        };
        if let (Some(e), true) = (live(&plan.expected), matches) {
            let leaves = match live(&plan.target) {
                None => true,
                Some(t) => t.file_type != e.file_type || t.path != e.path,
            };
            if leaves {
                freed.insert(e.path.clone());
            }
        }
        expected_on_disk.push(entry);
        matches_expected.push(matches);
        tracker.advance(plan.id, HistoryState::WinnerDetermined);
    }

    let occupant = |path: &str, target: &FileVersion| -> Result<Occupant> {
        match disk.stat(path)? {
            None => Ok(Occupant::Free),
            Some(_) if freed.contains(path) => Ok(Occupant::Free),
            Some(entry) if disk.matches(path, &entry, target)? => Ok(Occupant::AlreadyTarget),
            Some(entry) => Ok(Occupant::Other(entry.file_type)),
        }
    };

    let mut actions = Vec::new();
    for (i, plan) in plans.iter().enumerate() {
        let before = actions.len();
        let expected = live(&plan.expected);
        let target = live(&plan.target);
        match (expected, target) {
            (None, None) => {}
            (None, Some(t)) => match occupant(&t.path, t)? {
                Occupant::Free => actions.push(FileSystemAction::New { target: t.clone() }),
                Occupant::AlreadyTarget => {}
                Occupant::Other(kind) => {
                    actions.push(conflict(plan.id, &t.path, kind));
                    actions.push(FileSystemAction::New { target: t.clone() });
                }
            },
            (Some(e), t) if matches_expected[i] => match t {
                None => actions.push(FileSystemAction::Delete { local: e.clone() }),
                Some(t) if t.file_type != e.file_type => {
                    actions.push(FileSystemAction::Delete { local: e.clone() });
                    if t.path != e.path {
                        if let Occupant::Other(kind) = occupant(&t.path, t)? {
                            actions.push(conflict(plan.id, &t.path, kind));
                        }
                    }
                    actions.push(FileSystemAction::New { target: t.clone() });
                }
                Some(t) if t.path != e.path => {
                    if let Occupant::Other(kind) = occupant(&t.path, t)? {
                        actions.push(conflict(plan.id, &t.path, kind));
                    }
                    actions.push(FileSystemAction::Rename {
                        local: e.clone(),
                        target: t.clone(),
                    });
                    if !t.same_content(e) {
                        let moved = FileVersion {
                            path: t.path.clone(),
                            ..e.clone()
                        };
                        actions.push(FileSystemAction::Change {
                            local: moved,
                            target: t.clone(),
                        });
                    }
                }
                Some(t) if !t.same_content(e) => actions.push(FileSystemAction::Change {
                    local: e.clone(),
                    target: t.clone(),
                }),
                Some(t) if !t.same_attributes(e) => {
                    actions.push(FileSystemAction::SetAttributes { target: t.clone() })
                }
                Some(_) => {}
            },
            // disk diverged from what the database recorded
            (Some(_), None) => {}
            (Some(e), Some(t)) => {
                match &expected_on_disk[i] {
                    None => {
                        if !t.same_content(e) {
                            match occupant(&t.path, t)? {
                                Occupant::Free => {
                                    actions.push(FileSystemAction::New { target: t.clone() })
                                }
                                Occupant::AlreadyTarget => {}
                                Occupant::Other(kind) => {
                                    actions.push(conflict(plan.id, &t.path, kind));
                                    actions.push(FileSystemAction::New { target: t.clone() });
                                }
                            }
                        }
                    }
                    Some(entry) => {
                        if t.path == e.path {
                            if !disk.matches(&t.path, entry, t)? {
                                actions.push(conflict(plan.id, &e.path, entry.file_type));
                                actions.push(FileSystemAction::New { target: t.clone() });
                            }
                        } else {
                            match occupant(&t.path, t)? {
                                Occupant::Free => {
                                    actions.push(FileSystemAction::New { target: t.clone() })
                                }
                                Occupant::AlreadyTarget => {}
                                Occupant::Other(kind) => {
                                    actions.push(conflict(plan.id, &t.path, kind));
                                    actions.push(FileSystemAction::New { target: t.clone() });
                                }
                            }
                        }
                    }
                }
            }
        }
        if actions.len() > before {
            tracker.advance(plan.id, HistoryState::ActionPlanned);
        } else {
            tracker.advance(plan.id, HistoryState::Applied);
        }
    }

    // a folder that another history keeps or creates at the same path stays
    let wanted_folders: HashSet<&str> = plans
        .iter()
        .filter_map(|p| live(&p.target))
        .filter(|t| t.file_type == FileType::Folder)
        .map(|t| t.path.as_str())
        .collect();
    actions.retain(|a| {
        !matches!(a, FileSystemAction::Delete { local }
            if local.file_type == FileType::Folder && wanted_folders.contains(local.path.as_str()))
    });

    debug!(histories = plans.len(), actions = actions.len(), "actions planned");
    Ok(actions)
}

fn conflict(history_id: FileHistoryId, path: &str, file_type: FileType) -> FileSystemAction {
    FileSystemAction::Conflict {
        history_id,
        path: path.to_string(),
        file_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;
    use peersync_chunk::file_checksum;
    use peersync_meta::{DatabaseVersionHeader, FileStatus, Timestamp, VectorClock};

    fn header(client: &str, seq: u64) -> DatabaseVersionHeader {
        DatabaseVersionHeader {
            client: client.to_string(),
            timestamp: Timestamp::from_millis(seq),
            vector_clock: [(client, seq)].into_iter().collect::<VectorClock>(),
        }
    }

    fn file(id: FileHistoryId, version: u64, path: &str, content: &[u8]) -> FileVersion {
        FileVersion {
            history_id: id,
            version,
            path: path.to_string(),
            file_type: FileType::File,
            status: if version == 1 { FileStatus::New } else { FileStatus::Changed },
            size: content.len() as u64,
            last_modified: Timestamp::from_millis(1_000 * version),
            updated: Timestamp::from_millis(1_000 * version),
            checksum: Some(file_checksum(content)),
            link_target: None,
            posix_permissions: None,
            dos_attributes: None,
        }
    }

    fn folder(id: FileHistoryId, version: u64, path: &str, status: FileStatus) -> FileVersion {
        FileVersion {
            file_type: FileType::Folder,
            size: 0,
            checksum: None,
            status,
            ..file(id, version, path, b"")
        }
    }

    fn dbv(client: &str, seq: u64, versions: Vec<FileVersion>) -> DatabaseVersion {
        let mut dv = DatabaseVersion::new(header(client, seq));
        for v in versions {
            let mut h = PartialFileHistory::new(v.history_id);
            h.add_version(v);
            dv.file_histories.push(h);
        }
        dv
    }

    fn histories(versions: &[FileVersion]) -> BTreeMap<FileHistoryId, PartialFileHistory> {
        let mut out: BTreeMap<FileHistoryId, PartialFileHistory> = BTreeMap::new();
        for v in versions {
            out.entry(v.history_id)
                .or_insert_with(|| PartialFileHistory::new(v.history_id))
                .add_version(v.clone());
        }
        out
    }

    fn plan(
        root: &Path,
        known: &[FileVersion],
        pruned: &[DatabaseVersion],
        applied: &[DatabaseVersion],
    ) -> Vec<FileSystemAction> {
        let histories = histories(known);
        let input = PlanInput {
            local_client: "B",
            histories: &histories,
            pruned,
            applied,
        };
        plan_actions(&input, &StdFileSystem, root, &mut HistoryTracker::new()).unwrap()
    }

    #[test]
    fn new_remote_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let id = FileHistoryId::new_random();
        let actions = plan(dir.path(), &[], &[], &[dbv("A", 1, vec![file(id, 1, "a.txt", b"hi")])]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], FileSystemAction::New { target } if target.path == "a.txt"));
    }

    #[test]
    fn deleting_an_absent_folder_plans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let id = FileHistoryId::new_random();
        let known = folder(id, 1, "gone", FileStatus::New);
        let deleted = folder(id, 2, "gone", FileStatus::Deleted);
        let actions = plan(dir.path(), &[known], &[], &[dbv("A", 2, vec![deleted])]);
        assert!(actions.is_empty(), "{:?}", actions);
    }

    #[test]
    fn target_already_on_disk_plans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        let id = FileHistoryId::new_random();
        let actions = plan(
            dir.path(),
            &[],
            &[],
            &[dbv("A", 1, vec![folder(id, 1, "docs", FileStatus::New)])],
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn unknown_local_file_becomes_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"mine").unwrap();
        let id = FileHistoryId::new_random();
        let actions = plan(dir.path(), &[], &[], &[dbv("A", 1, vec![file(id, 1, "a.txt", b"theirs")])]);
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], FileSystemAction::Conflict { path, .. } if path == "a.txt"));
        assert!(matches!(&actions[1], FileSystemAction::New { .. }));
    }

    #[test]
    fn rename_of_unmodified_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = FileHistoryId::new_random();
        let v1 = file(id, 1, "old.txt", b"same");
        std::fs::write(dir.path().join("old.txt"), b"same").unwrap();
        let mut v2 = v1.successor(FileStatus::Renamed);
        v2.path = "new.txt".into();
        let actions = plan(dir.path(), &[v1], &[], &[dbv("A", 2, vec![v2])]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], FileSystemAction::Rename { local, target }
            if local.path == "old.txt" && target.path == "new.txt"));
    }

    #[test]
    fn locally_modified_file_is_preserved_on_remote_change() {
        let dir = tempfile::tempdir().unwrap();
        let id = FileHistoryId::new_random();
        let v1 = file(id, 1, "a.txt", b"base");
        std::fs::write(dir.path().join("a.txt"), b"local edit").unwrap();
        let v2 = file(id, 2, "a.txt", b"remote edit");
        let actions = plan(dir.path(), &[v1], &[], &[dbv("A", 2, vec![v2])]);
        let kinds: Vec<_> = actions.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec!["conflict", "new"]);
    }

    #[test]
    fn losing_own_change_is_kept_as_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let id = FileHistoryId::new_random();
        let v1 = file(id, 1, "a.txt", b"base");
        let mine = file(id, 2, "a.txt", b"mine!");
        let theirs = file(id, 2, "a.txt", b"theirs");
        std::fs::write(dir.path().join("a.txt"), b"mine!").unwrap();
        let pruned = vec![dbv("B", 2, vec![mine.clone()])];
        let actions = plan(dir.path(), &[v1, mine], &pruned, &[dbv("A", 2, vec![theirs])]);
        let kinds: Vec<_> = actions.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec!["conflict", "new"]);
    }

    #[test]
    fn remote_delete_of_unmodified_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = FileHistoryId::new_random();
        let v1 = file(id, 1, "a.txt", b"x");
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let mut v2 = v1.successor(FileStatus::Deleted);
        v2.version = 2;
        let mut tracker = HistoryTracker::new();
        let histories = histories(&[v1]);
        let applied = [dbv("A", 2, vec![v2])];
        let input = PlanInput {
            local_client: "B",
            histories: &histories,
            pruned: &[],
            applied: &applied,
        };
        let actions = plan_actions(&input, &StdFileSystem, dir.path(), &mut tracker).unwrap();
        assert!(matches!(&actions[..], [FileSystemAction::Delete { .. }]));
        assert_eq!(tracker.state(&id), HistoryState::ActionPlanned);
    }
}
