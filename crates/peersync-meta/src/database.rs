//! Local database: every database version this client has applied.
//!
//! Durability comes from the append-only [`RecordLog`]; queries run against a
//! [`KvStore`] index rebuilt from the log on open. Writers hold the state lock
//! exclusively and publish each version with a single atomic batch, so readers
//! never observe a partially applied version.
//!
//! Index layout (values are bincode):
//!
//! ```text
//! v/<seq>                   DatabaseVersion, seq = local insertion order
//! h/<client>\0<counter>     seq of that header
//! f/<history>/<version>     FileVersion
//! p/<path>                  history currently occupying the path
//! x/<chunk>                 ChunkLocation
//! m/<multichunk>            Vec<PackedEntry>
//! t/<content>               FileContent
//! ```
//!
//! Names of analysed remote database files live beside the index, not in it:
//! they survive the reindex done when losing versions are removed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use peersync_chunk::{
    ChunkChecksum, ChunkLocation, ChunkLookup, FileChecksum, MultiChunkId, PackedEntry,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::MetaError;
use crate::header_order::HeaderComparator;
use crate::kvstore::{BatchOp, KvStore, MemoryKvStore};
use crate::log::{LogRecord, RecordLog};
use crate::types::{
    ClientId, DatabaseVersion, DatabaseVersionHeader, FileContent, FileHistoryId, FileVersion,
    PartialFileHistory, Timestamp,
};
use crate::vector_clock::VectorClock;

/// Name of the log file inside the state directory
pub const LOG_FILE_NAME: &str = "database.log";

/// Restricts [`Database::file_tree`]
#[derive(Debug, Clone, Default)]
pub struct FileTreeFilter {
    /// Only paths starting with this prefix
    pub prefix: Option<String>,
    /// State as of this time instead of the latest state
    pub at: Option<Timestamp>,
}

impl FileTreeFilter {
    /// Latest state of every path
    pub fn all() -> Self {
        Self::default()
    }

    /// Latest state of paths under `prefix`
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            at: None,
        }
    }

    /// State of every path as of `at`
    pub fn at(at: Timestamp) -> Self {
        Self {
            prefix: None,
            at: Some(at),
        }
    }
}

struct State {
    log: Option<RecordLog>,
    next_seq: u64,
    /// Highest counter ever seen per client, including removed versions
    high_water: BTreeMap<ClientId, u64>,
    /// Remote database files already analysed by a down cycle
    known_files: BTreeSet<String>,
}

/// The local metadata database of one sync folder.
pub struct Database {
    kv: MemoryKvStore,
    state: RwLock<State>,
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>, MetaError> {
    bincode::serialize(value).map_err(|e| MetaError::format("index value", e))
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
    bincode::deserialize(bytes).map_err(|e| MetaError::format("index value", e))
}

fn version_key(seq: u64) -> Vec<u8> {
    format!("v/{:020}", seq).into_bytes()
}

fn header_key(header: &DatabaseVersionHeader) -> Vec<u8> {
    format!("h/{}\0{:020}", header.client, header.sequence()).into_bytes()
}

fn history_prefix(id: &FileHistoryId) -> Vec<u8> {
    format!("f/{}/", id).into_bytes()
}

fn file_version_key(v: &FileVersion) -> Vec<u8> {
    format!("f/{}/{:020}", v.history_id, v.version).into_bytes()
}

fn path_key(path: &str) -> Vec<u8> {
    format!("p/{}", path).into_bytes()
}

fn chunk_key(c: &ChunkChecksum) -> Vec<u8> {
    format!("x/{}", c.to_hex()).into_bytes()
}

fn multichunk_key(id: &MultiChunkId) -> Vec<u8> {
    format!("m/{}", id.to_hex()).into_bytes()
}

fn content_key(c: &FileChecksum) -> Vec<u8> {
    format!("t/{}", c.to_hex()).into_bytes()
}

impl Database {
    /// Open (or create) the database stored in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MetaError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let (log, records) = RecordLog::open(dir.as_ref().join(LOG_FILE_NAME))?;

        let mut versions: Vec<DatabaseVersion> = Vec::new();
        let mut high_water: BTreeMap<ClientId, u64> = BTreeMap::new();
        let mut known_files: BTreeSet<String> = BTreeSet::new();
        for record in records {
            match record {
                LogRecord::AddVersion(v) => {
                    bump(&mut high_water, &v.header);
                    versions.push(v);
                }
                LogRecord::RemoveVersions(headers) => {
                    let gone: HashSet<&DatabaseVersionHeader> = headers.iter().collect();
                    versions.retain(|v| !gone.contains(&v.header));
                }
                LogRecord::KnownDatabases(names) => known_files.extend(names),
            }
        }

        let db = Self {
            kv: MemoryKvStore::new(),
            state: RwLock::new(State {
                log: Some(log),
                next_seq: 0,
                high_water,
                known_files,
            }),
        };
        {
            let mut state = db.write_state()?;
            db.reindex(&mut state, versions)?;
            info!(
                dir = %dir.as_ref().display(),
                versions = state.next_seq,
                "local database opened"
            );
        }
        Ok(db)
    }

    /// A database without a log, for tests and scratch merges
    pub fn in_memory() -> Self {
        Self {
            kv: MemoryKvStore::new(),
            state: RwLock::new(State {
                log: None,
                next_seq: 0,
                high_water: BTreeMap::new(),
                known_files: BTreeSet::new(),
            }),
        }
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, State>, MetaError> {
        self.state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>, MetaError> {
        self.state
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }

    /// Persist and index a new database version
    #[instrument(skip(self, version), fields(header = %version.header))]
    pub fn add_database_version(&self, version: DatabaseVersion) -> Result<(), MetaError> {
        let mut state = self.write_state()?;
        if self.kv.contains_key(&header_key(&version.header))? {
            return Err(MetaError::DuplicateVersion(version.header.to_string()));
        }
        if let Some(log) = state.log.as_mut() {
            log.append(&LogRecord::AddVersion(version.clone()))?;
        }
        self.index_version(&mut state, &version)?;
        debug!(
            histories = version.file_histories.len(),
            multichunks = version.multichunks.len(),
            "database version added"
        );
        Ok(())
    }

    /// Drop database versions that lost reconciliation
    #[instrument(skip(self, headers), fields(count = headers.len()))]
    pub fn remove_database_versions(
        &self,
        headers: &[DatabaseVersionHeader],
    ) -> Result<(), MetaError> {
        if headers.is_empty() {
            return Ok(());
        }
        let mut state = self.write_state()?;
        let gone: HashSet<&DatabaseVersionHeader> = headers.iter().collect();
        let remaining: Vec<DatabaseVersion> = self
            .versions_locked()?
            .into_iter()
            .filter(|v| !gone.contains(&v.header))
            .collect();
        if let Some(log) = state.log.as_mut() {
            log.append(&LogRecord::RemoveVersions(headers.to_vec()))?;
        }
        self.reindex(&mut state, remaining)?;
        info!(removed = headers.len(), "database versions removed");
        Ok(())
    }

    /// Remember remote database files that a down cycle analysed
    pub fn add_known_database_files(&self, names: &[String]) -> Result<(), MetaError> {
        let mut state = self.write_state()?;
        let fresh: Vec<String> = names
            .iter()
            .filter(|n| !state.known_files.contains(*n))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        if let Some(log) = state.log.as_mut() {
            log.append(&LogRecord::KnownDatabases(fresh.clone()))?;
        }
        debug!(count = fresh.len(), "remote database files marked known");
        state.known_files.extend(fresh);
        Ok(())
    }

    /// True if a down cycle already analysed the remote database file `name`
    pub fn is_known_database_file(&self, name: &str) -> Result<bool, MetaError> {
        Ok(self.read_state()?.known_files.contains(name))
    }

    fn reindex(&self, state: &mut State, versions: Vec<DatabaseVersion>) -> Result<(), MetaError> {
        self.kv.clear()?;
        state.next_seq = 0;
        for version in &versions {
            self.index_version(state, version)?;
        }
        Ok(())
    }

    fn index_version(&self, state: &mut State, version: &DatabaseVersion) -> Result<(), MetaError> {
        let seq = state.next_seq;
        let mut deletes = Vec::new();
        let mut puts = vec![
            BatchOp::put(version_key(seq), enc(version)?),
            BatchOp::put(header_key(&version.header), seq.to_be_bytes().to_vec()),
        ];

        for history in &version.file_histories {
            let previous = self.last_version_locked(&history.id)?;
            let mut merged_last = previous.clone();
            for v in history.versions.values() {
                puts.push(BatchOp::put(file_version_key(v), enc(v)?));
                if merged_last.as_ref().map_or(true, |l| v.version >= l.version) {
                    merged_last = Some(v.clone());
                }
            }
            if let Some(prev) = previous.as_ref().filter(|p| !p.is_deleted()) {
                if self.path_owner_locked(&prev.path)? == Some(history.id) {
                    deletes.push(BatchOp::delete(path_key(&prev.path)));
                }
            }
            if let Some(last) = merged_last.as_ref().filter(|l| !l.is_deleted()) {
                puts.push(BatchOp::put(path_key(&last.path), enc(&history.id)?));
            }
        }
        for mc in &version.multichunks {
            puts.push(BatchOp::put(multichunk_key(&mc.id), enc(&mc.chunks)?));
            for entry in &mc.chunks {
                let key = chunk_key(&entry.checksum);
                if !self.kv.contains_key(&key)? {
                    let location = ChunkLocation {
                        multichunk_id: mc.id,
                        offset: entry.offset,
                    };
                    puts.push(BatchOp::put(key, enc(&location)?));
                }
            }
        }
        for content in &version.file_contents {
            puts.push(BatchOp::put(content_key(&content.checksum), enc(content)?));
        }

        deletes.extend(puts);
        self.kv.write_batch(deletes)?;
        state.next_seq += 1;
        bump(&mut state.high_water, &version.header);
        Ok(())
    }

    fn versions_locked(&self) -> Result<Vec<DatabaseVersion>, MetaError> {
        self.kv
            .scan_prefix(b"v/")?
            .iter()
            .map(|(_, v)| dec(v))
            .collect()
    }

    fn last_version_locked(&self, id: &FileHistoryId) -> Result<Option<FileVersion>, MetaError> {
        match self.kv.scan_prefix(&history_prefix(id))?.last() {
            Some((_, v)) => Ok(Some(dec(v)?)),
            None => Ok(None),
        }
    }

    fn path_owner_locked(&self, path: &str) -> Result<Option<FileHistoryId>, MetaError> {
        match self.kv.get(&path_key(path))? {
            Some(v) => Ok(Some(dec(&v)?)),
            None => Ok(None),
        }
    }

    /// Every applied database version, in application order
    pub fn database_versions(&self) -> Result<Vec<DatabaseVersion>, MetaError> {
        let _state = self.read_state()?;
        self.versions_locked()
    }

    /// Number of applied database versions
    pub fn version_count(&self) -> Result<u64, MetaError> {
        Ok(self.read_state()?.next_seq)
    }

    /// Header of the most recently applied database version
    pub fn last_database_version_header(&self) -> Result<Option<DatabaseVersionHeader>, MetaError> {
        let _state = self.read_state()?;
        match self.kv.scan_prefix(b"v/")?.last() {
            Some((_, v)) => Ok(Some(dec::<DatabaseVersion>(v)?.header)),
            None => Ok(None),
        }
    }

    /// True if a version with exactly this header is applied
    pub fn contains_header(&self, header: &DatabaseVersionHeader) -> Result<bool, MetaError> {
        let _state = self.read_state()?;
        let Some(seq) = self.kv.get(&header_key(header))? else {
            return Ok(false);
        };
        let seq: [u8; 8] = seq
            .as_slice()
            .try_into()
            .map_err(|_| MetaError::format("header index", "bad sequence"))?;
        match self.kv.get(&version_key(u64::from_be_bytes(seq)))? {
            Some(v) => Ok(dec::<DatabaseVersion>(&v)?.header == *header),
            None => Ok(false),
        }
    }

    /// Highest applied sequence per client, as a vector clock
    pub fn known_database_versions(&self) -> Result<VectorClock, MetaError> {
        let _state = self.read_state()?;
        let mut known = VectorClock::new();
        for (key, _) in self.kv.scan_prefix(b"h/")? {
            let key = String::from_utf8_lossy(&key[2..]).into_owned();
            if let Some((client, counter)) = key.split_once('\0') {
                let counter: u64 = counter
                    .parse()
                    .map_err(|_| MetaError::format("header index", key.clone()))?;
                if counter > known.get(client) {
                    known.set(client, counter);
                }
            }
        }
        Ok(known)
    }

    /// Pointwise maximum of every applied header's clock
    pub fn current_vector_clock(&self) -> Result<VectorClock, MetaError> {
        let mut clock = VectorClock::new();
        for header in self.local_branch(&HeaderComparator::default())? {
            clock.merge(&header.vector_clock);
        }
        Ok(clock)
    }

    /// Highest counter ever used by `client` here, including removed versions
    pub fn high_water(&self, client: &str) -> Result<u64, MetaError> {
        Ok(self
            .read_state()?
            .high_water
            .get(client)
            .copied()
            .unwrap_or(0))
    }

    /// Every applied header in deterministic causal order
    pub fn local_branch(
        &self,
        comparator: &HeaderComparator,
    ) -> Result<Vec<DatabaseVersionHeader>, MetaError> {
        let mut headers: Vec<DatabaseVersionHeader> = self
            .database_versions()?
            .into_iter()
            .map(|v| v.header)
            .collect();
        comparator.sort(&mut headers);
        Ok(headers)
    }

    /// Full history of one file
    pub fn file_history(&self, id: &FileHistoryId) -> Result<Option<PartialFileHistory>, MetaError> {
        let _state = self.read_state()?;
        let rows = self.kv.scan_prefix(&history_prefix(id))?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut history = PartialFileHistory::new(*id);
        for (_, v) in rows {
            history.add_version(dec(&v)?);
        }
        Ok(Some(history))
    }

    /// Every file history with all of its versions
    pub fn file_histories_with_versions(
        &self,
    ) -> Result<BTreeMap<FileHistoryId, PartialFileHistory>, MetaError> {
        let _state = self.read_state()?;
        let mut out: BTreeMap<FileHistoryId, PartialFileHistory> = BTreeMap::new();
        for (_, v) in self.kv.scan_prefix(b"f/")? {
            let version: FileVersion = dec(&v)?;
            out.entry(version.history_id)
                .or_insert_with(|| PartialFileHistory::new(version.history_id))
                .add_version(version);
        }
        Ok(out)
    }

    /// Last known version of every file history
    pub fn last_file_versions(&self) -> Result<HashMap<FileHistoryId, FileVersion>, MetaError> {
        Ok(self
            .file_histories_with_versions()?
            .into_iter()
            .filter_map(|(id, h)| h.last_version().cloned().map(|v| (id, v)))
            .collect())
    }

    /// Current-state projection: path to non-deleted latest version
    pub fn file_tree(
        &self,
        filter: &FileTreeFilter,
    ) -> Result<BTreeMap<String, FileVersion>, MetaError> {
        let prefix = filter.prefix.as_deref().unwrap_or("");
        let mut tree = BTreeMap::new();
        match filter.at {
            None => {
                let _state = self.read_state()?;
                for (_, owner) in self.kv.scan_prefix(&path_key(prefix))? {
                    let id: FileHistoryId = dec(&owner)?;
                    if let Some(v) = self.last_version_locked(&id)? {
                        if !v.is_deleted() {
                            tree.insert(v.path.clone(), v);
                        }
                    }
                }
            }
            Some(at) => {
                for history in self.file_histories_with_versions()?.into_values() {
                    let as_of = history
                        .versions
                        .values()
                        .filter(|v| v.updated <= at)
                        .next_back();
                    if let Some(v) = as_of {
                        if !v.is_deleted() && v.path.starts_with(prefix) {
                            tree.insert(v.path.clone(), v.clone());
                        }
                    }
                }
            }
        }
        Ok(tree)
    }

    /// Where a chunk is stored
    pub fn chunk_location(&self, checksum: &ChunkChecksum) -> Result<Option<ChunkLocation>, MetaError> {
        let _state = self.read_state()?;
        self.kv.get(&chunk_key(checksum))?.map(|v| dec(&v)).transpose()
    }

    /// Ordered chunks of a file content
    pub fn content_chunks(&self, checksum: &FileChecksum) -> Result<Option<FileContent>, MetaError> {
        let _state = self.read_state()?;
        self.kv.get(&content_key(checksum))?.map(|v| dec(&v)).transpose()
    }

    /// Records stored in a multichunk
    pub fn multichunk_chunks(&self, id: &MultiChunkId) -> Result<Option<Vec<PackedEntry>>, MetaError> {
        let _state = self.read_state()?;
        self.kv.get(&multichunk_key(id))?.map(|v| dec(&v)).transpose()
    }
}

impl ChunkLookup for Database {
    fn contains_chunk(&self, checksum: &ChunkChecksum) -> bool {
        match self.kv.contains_key(&chunk_key(checksum)) {
            Ok(found) => found,
            Err(e) => {
                warn!(chunk = %checksum, error = %e, "chunk lookup failed, treating chunk as new");
                false
            }
        }
    }
}

fn bump(high_water: &mut BTreeMap<ClientId, u64>, header: &DatabaseVersionHeader) {
    for (client, counter) in header.vector_clock.iter() {
        let entry = high_water.entry(client.to_string()).or_insert(0);
        *entry = (*entry).max(counter);
    }
}
