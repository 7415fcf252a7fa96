//! Fault-injecting wrapper around another storage backend.
//!
//! Faults are matched against every call in order: the operation kind, an
//! optional 1-based call number for that operation, and an optional substring
//! of the file name involved (for moves, source or target). Each fault fires
//! a fixed number of times.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;

use super::{RemoteFileMeta, RemoteStorage, StorageError};

/// Storage operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageOp {
    /// `list`
    List,
    /// `upload`
    Upload,
    /// `download`
    Download,
    /// `move_file`
    Move,
    /// `delete`
    Delete,
}

/// One injected failure
#[derive(Debug, Clone)]
pub struct Fault {
    op: StorageOp,
    call: Option<usize>,
    name_contains: Option<String>,
    retryable: bool,
    remaining: usize,
}

impl Fault {
    /// Fail the next matching `op` once, with a non-retryable error
    pub fn on(op: StorageOp) -> Self {
        Self {
            op,
            call: None,
            name_contains: None,
            retryable: false,
            remaining: 1,
        }
    }

    /// Only the n-th call (1-based) of this operation matches
    pub fn call(mut self, n: usize) -> Self {
        self.call = Some(n);
        self
    }

    /// Only calls touching a name that contains `needle` match
    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    /// Fail with a transient error the retry layer will retry
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Fire this many times before disarming
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    fn matches(&self, op: StorageOp, call: usize, names: &[&str]) -> bool {
        self.remaining > 0
            && self.op == op
            && self.call.map_or(true, |n| n == call)
            && self
                .name_contains
                .as_deref()
                .map_or(true, |needle| names.iter().any(|n| n.contains(needle)))
    }

    fn error(&self, op: StorageOp, names: &[&str]) -> StorageError {
        let what = format!("injected {:?} failure on {}", op, names.join(" -> "));
        if self.retryable {
            StorageError::Timeout(what)
        } else {
            StorageError::PermissionDenied(what)
        }
    }
}

#[derive(Debug, Default)]
struct FaultState {
    faults: Vec<Fault>,
    calls: BTreeMap<StorageOp, usize>,
    injected: usize,
}

/// [`RemoteStorage`] that forwards to `inner` unless a [`Fault`] matches.
#[derive(Clone)]
pub struct UnreliableStorage {
    inner: Arc<dyn RemoteStorage>,
    state: Arc<Mutex<FaultState>>,
}

impl UnreliableStorage {
    /// Wrap `inner` with no faults armed
    pub fn new(inner: Arc<dyn RemoteStorage>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Arm a fault
    pub fn with_fault(self, fault: Fault) -> Self {
        self.arm(fault);
        self
    }

    /// Arm a fault on a shared instance
    pub fn arm(&self, fault: Fault) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(fault);
        }
    }

    /// Number of failures injected so far
    pub fn injected(&self) -> usize {
        self.state.lock().map(|s| s.injected).unwrap_or(0)
    }

    fn check(&self, op: StorageOp, names: &[&str]) -> Result<(), StorageError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let call = {
            let counter = state.calls.entry(op).or_insert(0);
            *counter += 1;
            *counter
        };
        let hit = state
            .faults
            .iter_mut()
            .find(|f| f.matches(op, call, names))
            .map(|f| {
                f.remaining -= 1;
                f.error(op, names)
            });
        match hit {
            Some(err) => {
                state.injected += 1;
                warn!(?op, call, error = %err, "injecting storage failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStorage for UnreliableStorage {
    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, RemoteFileMeta>, StorageError> {
        self.check(StorageOp::List, &[prefix])?;
        self.inner.list(prefix).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), StorageError> {
        self.check(StorageOp::Upload, &[remote])?;
        self.inner.upload(local, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), StorageError> {
        self.check(StorageOp::Download, &[remote])?;
        self.inner.download(remote, local).await
    }

    async fn move_file(&self, source: &str, target: &str) -> Result<(), StorageError> {
        self.check(StorageOp::Move, &[source, target])?;
        self.inner.move_file(source, target).await
    }

    async fn delete(&self, remote: &str) -> Result<bool, StorageError> {
        self.check(StorageOp::Delete, &[remote])?;
        self.inner.delete(remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn fault_fires_on_matching_call_only() {
        let mem = MemoryStorage::new();
        mem.put("a", b"1".to_vec());
        mem.put("b", b"2".to_vec());
        let storage = UnreliableStorage::new(Arc::new(mem.clone()))
            .with_fault(Fault::on(StorageOp::Move).call(2));

        storage.move_file("a", "a2").await.unwrap();
        let err = storage.move_file("b", "b2").await.unwrap_err();
        assert!(!err.is_retryable());
        storage.move_file("b", "b2").await.unwrap();
        assert_eq!(storage.injected(), 1);
        assert_eq!(mem.names(), vec!["a2".to_string(), "b2".to_string()]);
    }

    #[tokio::test]
    async fn name_filter_and_retryable() {
        let mem = MemoryStorage::new();
        mem.put("db-A-0000000002", b"x".to_vec());
        let storage = UnreliableStorage::new(Arc::new(mem))
            .with_fault(Fault::on(StorageOp::Delete).name_contains("db-A").retryable().times(2));
        assert!(storage.delete("other").await.is_ok());
        assert!(storage.delete("db-A-0000000002").await.unwrap_err().is_retryable());
        assert!(storage.delete("db-A-0000000002").await.is_err());
        assert!(storage.delete("db-A-0000000002").await.unwrap());
    }
}
