//! Per-folder cycle scheduling.
//!
//! Each managed folder gets one task that owns its [`SyncContext`] and runs
//! cycles one at a time. Requests arrive over a channel; while a cycle runs,
//! explicit requests are rejected with [`SyncError::Busy`] and watcher
//! signals wait in the channel. Watcher signals are debounced by the settle
//! delay and coalesced into one sync cycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason};
use crate::context::SyncContext;
use crate::down::{down, DownReport};
use crate::error::{Result, SyncError};
use crate::up::{up, UpReport};

/// Channel capacity for requests and events
const CHANNEL_CAPACITY: usize = 64;

/// Work a folder scheduler can be asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Upload local changes
    Up,
    /// Apply remote changes
    Down,
    /// Down, then up
    Sync,
    /// Stop the scheduler
    Shutdown,
}

enum Command {
    Run(SyncRequest),
    Changed,
}

/// What a finished cycle produced
#[derive(Debug)]
pub enum CycleResult {
    /// An up cycle
    Up(UpReport),
    /// A down cycle
    Down(DownReport),
    /// A down cycle followed by an up cycle
    Sync {
        /// The down half
        down: DownReport,
        /// The up half
        up: UpReport,
    },
}

/// Published after every cycle
#[derive(Debug)]
pub struct CycleEvent {
    /// Folder the cycle ran for
    pub folder: String,
    /// What was requested
    pub request: SyncRequest,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Outcome
    pub result: Result<CycleResult>,
}

/// Counters kept by a folder scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Cycles run
    pub cycles: u64,
    /// Cycles that ended with an error
    pub failures: u64,
    /// Watcher signals received
    pub change_signals: u64,
    /// When the last cycle finished
    pub last_finished: Option<DateTime<Utc>>,
}

fn stopped() -> SyncError {
    SyncError::Io(std::io::Error::other("folder scheduler stopped"))
}

/// Handle to a running folder scheduler. Clones control the same scheduler.
#[derive(Clone)]
pub struct FolderHandle {
    folder: String,
    sender: mpsc::Sender<Command>,
    busy: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CancelHandle>>>,
    stats: watch::Receiver<SchedulerStats>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl FolderHandle {
    /// Folder this handle controls
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Ask for a cycle. Fails with [`SyncError::Busy`] while one is running.
    pub fn request(&self, request: SyncRequest) -> Result<()> {
        if request != SyncRequest::Shutdown && self.busy.load(Ordering::SeqCst) {
            debug!(folder = %self.folder, ?request, "rejecting request, cycle in progress");
            return Err(SyncError::Busy);
        }
        self.sender
            .try_send(Command::Run(request))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SyncError::Busy,
                mpsc::error::TrySendError::Closed(_) => stopped(),
            })
    }

    /// Watcher signal: something in the folder changed
    pub fn notify_change(&self) {
        if let Err(e) = self.sender.try_send(Command::Changed) {
            debug!(folder = %self.folder, error = %e, "change signal dropped");
        }
    }

    /// True while a cycle runs
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Cancel the running cycle, if any
    pub fn cancel_current(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(handle) = current.as_ref() {
                handle.cancel(CancelReason::UserRequested);
            }
        }
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.stats.borrow().clone()
    }

    /// True until the scheduler task exits
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Cancel the running cycle, stop the scheduler and wait for it to exit
    pub async fn shutdown(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(handle) = current.as_ref() {
                handle.cancel(CancelReason::Shutdown);
            }
        }
        let _ = self.sender.send(Command::Run(SyncRequest::Shutdown)).await;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// Runs the cycles of one folder
pub struct FolderScheduler {
    ctx: SyncContext,
    folder: String,
    busy: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CancelHandle>>>,
    events: mpsc::Sender<CycleEvent>,
    stats_tx: watch::Sender<SchedulerStats>,
    stats: SchedulerStats,
}

impl FolderScheduler {
    /// Start a scheduler with its own event channel
    pub fn spawn(ctx: SyncContext) -> (FolderHandle, mpsc::Receiver<CycleEvent>) {
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self::start(ctx, events_tx), events_rx)
    }

    /// Start a scheduler that publishes to `events`
    pub fn start(ctx: SyncContext, events: mpsc::Sender<CycleEvent>) -> FolderHandle {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = watch::channel(SchedulerStats::default());
        let folder = ctx.local_dir().display().to_string();
        let busy = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));

        let scheduler = FolderScheduler {
            ctx,
            folder: folder.clone(),
            busy: Arc::clone(&busy),
            current: Arc::clone(&current),
            events,
            stats_tx,
            stats: SchedulerStats::default(),
        };
        let task = tokio::spawn(scheduler.run(command_rx));

        FolderHandle {
            folder,
            sender: command_tx,
            busy,
            current,
            stats: stats_rx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(folder = %self.folder, "folder scheduler started");
        let settle_delay = self.ctx.config().settle_delay();
        let mut settle: Option<Instant> = None;
        loop {
            let command = match settle {
                Some(deadline) => tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(deadline) => {
                        settle = None;
                        Some(Command::Run(SyncRequest::Sync))
                    }
                },
                None => rx.recv().await,
            };
            match command {
                None | Some(Command::Run(SyncRequest::Shutdown)) => break,
                Some(Command::Changed) => {
                    self.stats.change_signals += 1;
                    settle = Some(Instant::now() + settle_delay);
                }
                Some(Command::Run(request)) => {
                    if request != SyncRequest::Down {
                        settle = None;
                    }
                    self.cycle(request).await;
                }
            }
        }
        info!(folder = %self.folder, cycles = self.stats.cycles, "folder scheduler stopped");
    }

    async fn cycle(&mut self, request: SyncRequest) {
        let (token, handle) = new_cancel_pair();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(handle);
        }
        self.busy.store(true, Ordering::SeqCst);
        let started_at = Utc::now();
        debug!(folder = %self.folder, ?request, "cycle started");

        let ctx = &self.ctx;
        let result = async {
            match request {
                SyncRequest::Up => up(ctx, &token).await.map(CycleResult::Up),
                SyncRequest::Down => down(ctx, &token).await.map(CycleResult::Down),
                SyncRequest::Sync | SyncRequest::Shutdown => {
                    let down = down(ctx, &token).await?;
                    let up = up(ctx, &token).await?;
                    Ok::<_, SyncError>(CycleResult::Sync { down, up })
                }
            }
        }
        .await;

        self.busy.store(false, Ordering::SeqCst);
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        let finished_at = Utc::now();
        self.stats.cycles += 1;
        self.stats.last_finished = Some(finished_at);
        match &result {
            Ok(_) => info!(folder = %self.folder, ?request, "cycle finished"),
            Err(e) => {
                self.stats.failures += 1;
                warn!(folder = %self.folder, ?request, error = %e, "cycle failed");
            }
        }
        let _ = self.stats_tx.send(self.stats.clone());

        let event = CycleEvent {
            folder: self.folder.clone(),
            request,
            started_at,
            finished_at,
            result,
        };
        if let Err(e) = self.events.try_send(event) {
            debug!(folder = %self.folder, error = %e, "cycle event dropped");
        }
    }
}

/// Independent schedulers for several folders sharing one event channel
pub struct SyncDaemon {
    folders: BTreeMap<String, FolderHandle>,
    events: mpsc::Sender<CycleEvent>,
}

impl SyncDaemon {
    /// An empty daemon and the receiver of its cycle events
    pub fn new() -> (Self, mpsc::Receiver<CycleEvent>) {
        let (events, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                folders: BTreeMap::new(),
                events,
            },
            rx,
        )
    }

    /// Start scheduling the folder of `ctx`
    pub fn add_folder(&mut self, ctx: SyncContext) -> Result<FolderHandle> {
        let folder = ctx.local_dir().display().to_string();
        if self.folders.contains_key(&folder) {
            return Err(SyncError::Config(format!("folder {} is already managed", folder)));
        }
        let handle = FolderScheduler::start(ctx, self.events.clone());
        self.folders.insert(folder, handle.clone());
        Ok(handle)
    }

    /// Handle of a managed folder
    pub fn folder(&self, folder: &str) -> Option<&FolderHandle> {
        self.folders.get(folder)
    }

    /// Managed folders
    pub fn folders(&self) -> impl Iterator<Item = &str> {
        self.folders.keys().map(String::as_str)
    }

    /// Send `request` to every folder
    pub fn request_all(&self, request: SyncRequest) -> Vec<(String, Result<()>)> {
        self.folders
            .iter()
            .map(|(folder, handle)| (folder.clone(), handle.request(request)))
            .collect()
    }

    /// Stop every scheduler
    pub async fn shutdown(self) {
        for handle in self.folders.values() {
            handle.shutdown().await;
        }
    }
}
