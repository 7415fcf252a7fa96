//! Shared fixtures for the sync integration tests: clients with their own
//! folder and state sharing one remote.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use peersync_chunk::FileChecksum;
use peersync_meta::{FileHistoryId, FileTreeFilter, FileType};
use peersync_sync::{
    down, up, CancelToken, DownReport, MemoryStorage, RemoteStorage, SyncConfig, SyncContext,
    UpReport,
};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Name of the state directory inside a synced folder
pub const STATE_DIR: &str = ".peersync";

/// What a path holds on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(Vec<u8>),
    Folder,
    Symlink(PathBuf),
}

/// Config with fast retries for `client` syncing `dir`
pub fn config(client: &str, dir: &Path) -> SyncConfig {
    let mut config = SyncConfig::new(client, dir);
    config.retry.max_retries = 2;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

/// One client of a shared remote
pub struct Client {
    pub dir: TempDir,
    pub ctx: SyncContext,
}

impl Client {
    pub fn open(client: &str, storage: Arc<dyn RemoteStorage>) -> Self {
        Self::open_with(client, storage, |_| {})
    }

    pub fn open_with(
        client: &str,
        storage: Arc<dyn RemoteStorage>,
        adjust: impl FnOnce(&mut SyncConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(client, dir.path());
        adjust(&mut config);
        let ctx = SyncContext::open(config, storage).unwrap();
        Self { dir, ctx }
    }

    pub fn on_memory(client: &str, remote: &MemoryStorage) -> Self {
        Self::open(client, Arc::new(remote.clone()))
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn mkdir(&self, rel: &str) {
        std::fs::create_dir_all(self.path(rel)).unwrap();
    }

    pub fn read(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.path(rel)).unwrap()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).symlink_metadata().is_ok()
    }

    pub fn remove(&self, rel: &str) {
        let path = self.path(rel);
        if path.symlink_metadata().unwrap().is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
    }

    pub fn rename(&self, from: &str, to: &str) {
        std::fs::rename(self.path(from), self.path(to)).unwrap();
    }

    pub async fn up(&self) -> UpReport {
        up(&self.ctx, &CancelToken::none()).await.unwrap()
    }

    pub async fn down(&self) -> DownReport {
        down(&self.ctx, &CancelToken::none()).await.unwrap()
    }

    pub fn tree(&self) -> BTreeMap<String, Entry> {
        tree(self.dir.path())
    }

    pub fn db_tree(&self) -> BTreeMap<String, (FileHistoryId, FileType, Option<FileChecksum>)> {
        db_tree(&self.ctx)
    }
}

/// Everything under `root` except the state directory
pub fn tree(root: &Path) -> BTreeMap<String, Entry> {
    let mut entries = BTreeMap::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != STATE_DIR);
    for entry in walker {
        let entry = entry.unwrap();
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        let kind = entry.file_type();
        let value = if kind.is_symlink() {
            Entry::Symlink(std::fs::read_link(entry.path()).unwrap())
        } else if kind.is_dir() {
            Entry::Folder
        } else {
            Entry::File(std::fs::read(entry.path()).unwrap())
        };
        entries.insert(rel, value);
    }
    entries
}

/// Current database tree of a client, reduced to what must agree across clients
pub fn db_tree(ctx: &SyncContext) -> BTreeMap<String, (FileHistoryId, FileType, Option<FileChecksum>)> {
    ctx.database()
        .file_tree(&FileTreeFilter::all())
        .unwrap()
        .into_iter()
        .map(|(path, v)| (path, (v.history_id, v.file_type, v.checksum)))
        .collect()
}

/// Make `dst` hold exactly the files of `src`
pub async fn mirror(src: &MemoryStorage, dst: &MemoryStorage) {
    for name in dst.names() {
        if src.get(&name).is_none() {
            dst.delete(&name).await.unwrap();
        }
    }
    for name in src.names() {
        if let Some(data) = src.get(&name) {
            dst.put(&name, data);
        }
    }
}
