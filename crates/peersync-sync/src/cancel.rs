//! Cooperative cancellation of sync cycles.
//!
//! A cycle checks its [`CancelToken`] between phases. The scheduler keeps the
//! matching [`CancelHandle`] so a caller can stop the running cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::SyncError;

/// Reasons for cancelling a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit user cancellation
    #[default]
    UserRequested,
    /// The folder scheduler is shutting down
    Shutdown,
    /// A newer request supersedes this cycle
    Superseded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

/// Cloneable view of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn none() -> Self {
        new_cancel_pair().0
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        self.shared.reason.lock().ok().and_then(|r| *r)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The handle that triggers cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Trigger cancellation. The first reason given is kept.
    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.shared.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let shared = Arc::new(Shared::default());
    (
        CancelToken {
            shared: Arc::clone(&shared),
        },
        CancelHandle { shared },
    )
}
