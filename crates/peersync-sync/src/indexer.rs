//! Local change detection.
//!
//! Walks the synced folder, compares every entry with the current file tree
//! of the local database and produces the file versions of one new database
//! version. Files whose size and modification time match the database are
//! not read. New files whose content matches a vanished file become a rename
//! of that file's history.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path};

use peersync_chunk::{DedupOutput, Deduper, FileChecksum};
use peersync_meta::{
    Database, FileContent, FileHistoryId, FileStatus, FileTreeFilter, FileType, FileVersion,
    PartialFileHistory, Timestamp,
};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::error::Result;
use crate::fs::{DiskEntry, LocalFileSystem, TEMP_FILE_PREFIX};

/// Paths that changed since the last database version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Entries without a history
    pub new: Vec<String>,
    /// Entries whose content or attributes changed
    pub changed: Vec<String>,
    /// Moves detected by content, as (from, to)
    pub renamed: Vec<(String, String)>,
    /// Entries no longer on disk
    pub deleted: Vec<String>,
}

impl ChangeSet {
    /// True if nothing changed
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.renamed.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed entries
    pub fn len(&self) -> usize {
        self.new.len() + self.changed.len() + self.renamed.len() + self.deleted.len()
    }
}

/// Output of one indexing pass
#[derive(Debug)]
pub struct IndexResult {
    /// What changed
    pub changes: ChangeSet,
    /// One new version per changed history
    pub histories: Vec<PartialFileHistory>,
    /// File contents the database does not know yet
    pub contents: Vec<FileContent>,
    /// New chunks and sealed multichunks
    pub dedup: DedupOutput,
}

/// Compares the folder with the database
pub struct Indexer<'a> {
    fs: &'a dyn LocalFileSystem,
    root: &'a Path,
    state_dir: &'a Path,
    db: &'a Database,
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

struct Pass<'d> {
    deduper: Deduper,
    contents: Vec<FileContent>,
    content_seen: HashSet<FileChecksum>,
    db: &'d Database,
}

impl Pass<'_> {
    fn chunk(&mut self, fs: &dyn LocalFileSystem, path: &Path) -> Result<(FileChecksum, u64)> {
        let source = fs.open(path)?;
        let indexed = self.deduper.add_file(source, self.db)?;
        if self.content_seen.insert(indexed.checksum) && self.db.content_chunks(&indexed.checksum)?.is_none() {
            self.contents.push(FileContent {
                checksum: indexed.checksum,
                size: indexed.size,
                chunks: indexed.chunks,
            });
        }
        Ok((indexed.checksum, indexed.size))
    }
}

impl<'a> Indexer<'a> {
    /// Indexer for the folder at `root`; `state_dir` is never indexed
    pub fn new(fs: &'a dyn LocalFileSystem, root: &'a Path, state_dir: &'a Path, db: &'a Database) -> Self {
        Self {
            fs,
            root,
            state_dir,
            db,
        }
    }

    fn skipped(&self, path: &Path) -> bool {
        if path.starts_with(self.state_dir) {
            return true;
        }
        path.file_name()
            .map(|n| n.to_string_lossy().starts_with(TEMP_FILE_PREFIX))
            .unwrap_or(false)
    }

    fn new_version(&self, pass: &mut Pass<'_>, rel: String, disk: &DiskEntry, path: &Path) -> Result<FileVersion> {
        let (checksum, size) = match disk.file_type {
            FileType::File => {
                let (checksum, size) = pass.chunk(self.fs, path)?;
                (Some(checksum), size)
            }
            _ => (None, 0),
        };
        Ok(FileVersion {
            history_id: FileHistoryId::new_random(),
            version: 1,
            path: rel,
            file_type: disk.file_type,
            status: FileStatus::New,
            size,
            last_modified: disk.modified,
            updated: Timestamp::now(),
            checksum,
            link_target: disk.link_target.clone(),
            posix_permissions: disk.permissions,
            dos_attributes: None,
        })
    }

    fn changed_version(
        &self,
        pass: &mut Pass<'_>,
        known: &FileVersion,
        disk: &DiskEntry,
        path: &Path,
    ) -> Result<Option<FileVersion>> {
        let permissions_changed = disk.permissions.is_some() && disk.permissions != known.posix_permissions;
        let mut next = known.successor(FileStatus::Changed);
        next.posix_permissions = disk.permissions.or(known.posix_permissions);
        match disk.file_type {
            FileType::Folder => {}
            FileType::Symlink => {
                if disk.link_target == known.link_target && !permissions_changed {
                    return Ok(None);
                }
                next.link_target = disk.link_target.clone();
                return Ok(Some(next));
            }
            FileType::File => {
                let unmodified =
                    disk.size == known.size && disk.modified.as_millis() == known.last_modified.as_millis();
                if !unmodified {
                    let (checksum, size) = pass.chunk(self.fs, path)?;
                    if Some(checksum) != known.checksum {
                        next.checksum = Some(checksum);
                        next.size = size;
                        next.last_modified = disk.modified;
                        return Ok(Some(next));
                    }
                }
            }
        }
        if permissions_changed {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Index the folder, feeding new file content through `deduper`
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub fn index(&self, deduper: Deduper) -> Result<IndexResult> {
        let tree = self.db.file_tree(&FileTreeFilter::all())?;
        let mut pass = Pass {
            deduper,
            contents: Vec::new(),
            content_seen: HashSet::new(),
            db: self.db,
        };
        let mut changes = ChangeSet::default();
        let mut versions: Vec<FileVersion> = Vec::new();
        let mut fresh: Vec<FileVersion> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let walker = WalkDir::new(self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.skipped(e.path()));
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let Some(rel) = relative_path(self.root, entry.path()) else {
                continue;
            };
            // vanished while walking
            let Some(disk) = self.fs.stat(entry.path())? else {
                continue;
            };
            seen.insert(rel.clone());
            match tree.get(&rel) {
                Some(known) if known.file_type == disk.file_type => {
                    if let Some(next) = self.changed_version(&mut pass, known, &disk, entry.path())? {
                        changes.changed.push(rel);
                        versions.push(next);
                    }
                }
                Some(known) => {
                    debug!(path = %rel, from = ?known.file_type, to = ?disk.file_type, "type changed");
                    changes.deleted.push(rel.clone());
                    versions.push(known.successor(FileStatus::Deleted));
                    fresh.push(self.new_version(&mut pass, rel, &disk, entry.path())?);
                }
                None => fresh.push(self.new_version(&mut pass, rel, &disk, entry.path())?),
            }
        }

        let mut gone: Vec<&FileVersion> = tree.values().filter(|v| !seen.contains(&v.path)).collect();
        for version in fresh {
            let source = if version.file_type == FileType::File {
                gone.iter().position(|g| {
                    g.file_type == FileType::File && g.checksum == version.checksum && g.size == version.size
                })
            } else {
                None
            };
            match source {
                Some(i) => {
                    let old = gone.remove(i);
                    let mut renamed = old.successor(FileStatus::Renamed);
                    renamed.path = version.path.clone();
                    renamed.last_modified = version.last_modified;
                    renamed.posix_permissions = version.posix_permissions;
                    changes.renamed.push((old.path.clone(), version.path));
                    versions.push(renamed);
                }
                None => {
                    changes.new.push(version.path.clone());
                    versions.push(version);
                }
            }
        }
        for old in gone {
            changes.deleted.push(old.path.clone());
            versions.push(old.successor(FileStatus::Deleted));
        }

        let mut histories: HashMap<FileHistoryId, PartialFileHistory> = HashMap::new();
        let mut order = Vec::new();
        for version in versions {
            let id = version.history_id;
            histories
                .entry(id)
                .or_insert_with(|| {
                    order.push(id);
                    PartialFileHistory::new(id)
                })
                .add_version(version);
        }
        let histories = order.into_iter().filter_map(|id| histories.remove(&id)).collect();

        let dedup = pass.deduper.finish()?;
        info!(
            new = changes.new.len(),
            changed = changes.changed.len(),
            renamed = changes.renamed.len(),
            deleted = changes.deleted.len(),
            multichunks = dedup.sealed.len(),
            "local changes indexed"
        );
        Ok(IndexResult {
            changes,
            histories,
            contents: pass.contents,
            dedup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;
    use peersync_chunk::{Chunker, ChunkerConfig, PackerConfig};
    use peersync_meta::{DatabaseVersion, DatabaseVersionHeader, MultiChunkEntry, VectorClock};

    fn deduper() -> Deduper {
        Deduper::new(
            Chunker::with_config(ChunkerConfig::FixedOffset { size: 16 }).unwrap(),
            PackerConfig { capacity: 1024 },
        )
    }

    fn commit(db: &Database, result: IndexResult, seq: u64) {
        let mut clock = VectorClock::new();
        clock.set("A", seq);
        let mut version = DatabaseVersion::new(DatabaseVersionHeader {
            client: "A".into(),
            timestamp: Timestamp::now(),
            vector_clock: clock,
        });
        version.file_histories = result.histories;
        version.file_contents = result.contents;
        version.multichunks = result
            .dedup
            .sealed
            .iter()
            .map(|m| MultiChunkEntry {
                id: m.id,
                chunks: m.entries.clone(),
            })
            .collect();
        db.add_database_version(version).unwrap();
    }

    struct Folder {
        dir: tempfile::TempDir,
        db: Database,
    }

    impl Folder {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join(".peersync")).unwrap();
            Self {
                dir,
                db: Database::in_memory(),
            }
        }

        fn index(&self) -> IndexResult {
            let state = self.dir.path().join(".peersync");
            Indexer::new(&StdFileSystem, self.dir.path(), &state, &self.db)
                .index(deduper())
                .unwrap()
        }

        fn write(&self, rel: &str, data: &[u8]) {
            let path = self.dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
    }

    #[test]
    fn first_pass_finds_everything_except_state() {
        let folder = Folder::new();
        folder.write("a.txt", b"alpha alpha alpha alpha");
        folder.write("sub/b.txt", b"beta");
        folder.write(".peersync/db/ignored", b"x");
        folder.write(&format!("{}junk", TEMP_FILE_PREFIX), b"partial");

        let result = folder.index();
        assert_eq!(result.changes.new, vec!["a.txt", "sub", "sub/b.txt"]);
        assert_eq!(result.histories.len(), 3);
        assert_eq!(result.contents.len(), 2);
        assert_eq!(result.dedup.sealed.len(), 1);
    }

    #[test]
    fn unchanged_folder_yields_no_changes() {
        let folder = Folder::new();
        folder.write("a.txt", b"alpha");
        let first = folder.index();
        commit(&folder.db, first, 1);
        assert!(folder.index().changes.is_empty());
    }

    #[test]
    fn modification_rename_and_delete_are_detected() {
        let folder = Folder::new();
        folder.write("keep.txt", b"original content");
        folder.write("move-me.txt", b"moving content");
        folder.write("drop.txt", b"doomed");
        let first = folder.index();
        commit(&folder.db, first, 1);

        folder.write("keep.txt", b"edited content, longer than before");
        std::fs::rename(folder.dir.path().join("move-me.txt"), folder.dir.path().join("moved.txt")).unwrap();
        std::fs::remove_file(folder.dir.path().join("drop.txt")).unwrap();

        let result = folder.index();
        assert_eq!(result.changes.changed, vec!["keep.txt"]);
        assert_eq!(result.changes.renamed, vec![("move-me.txt".to_string(), "moved.txt".to_string())]);
        assert_eq!(result.changes.deleted, vec!["drop.txt"]);
        assert!(result.changes.new.is_empty());

        let renamed = result
            .histories
            .iter()
            .flat_map(|h| h.versions.values())
            .find(|v| v.path == "moved.txt")
            .unwrap();
        assert_eq!(renamed.status, FileStatus::Renamed);
        assert_eq!(renamed.version, 2);
    }

    #[test]
    fn identical_files_share_content() {
        let folder = Folder::new();
        folder.write("one.txt", b"same bytes in both files");
        folder.write("two.txt", b"same bytes in both files");
        let result = folder.index();
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.dedup.stats.chunks_deduplicated, result.dedup.stats.chunks_total / 2);
    }

    #[test]
    fn type_change_replaces_history() {
        let folder = Folder::new();
        folder.write("thing", b"file first");
        let first = folder.index();
        commit(&folder.db, first, 1);

        std::fs::remove_file(folder.dir.path().join("thing")).unwrap();
        std::fs::create_dir(folder.dir.path().join("thing")).unwrap();
        let result = folder.index();
        assert_eq!(result.changes.deleted, vec!["thing"]);
        assert_eq!(result.changes.new, vec!["thing"]);
        assert_eq!(result.histories.len(), 2);
    }
}
