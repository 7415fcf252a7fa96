//! Winner selection between the local branch and remote branches.
//!
//! A branch is the causally ordered list of database version headers one
//! client has built on. The local branch is every header applied here. A
//! remote client's branch is every known header its newest version has seen.
//! The branches are walked position by position; at each position the
//! [`HeaderComparator`] picks a winning header and every branch holding a
//! different header drops out. A branch that ends while others continue is a
//! prefix of them and drops out as well. Every client that sees the same
//! headers picks the same winner.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use peersync_meta::{DatabaseVersionHeader, FileHistoryId, HeaderComparator};
use tracing::{debug, info, instrument};

use crate::error::{Result, SyncError};

/// Headers of one client's branch, in deterministic causal order
pub type Branch = Vec<DatabaseVersionHeader>;

/// What reconciliation decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Client whose branch won
    pub winner_client: String,
    /// The winning branch
    pub winner_branch: Branch,
    /// Local headers outside the winning branch, to be removed
    pub prune: Vec<DatabaseVersionHeader>,
    /// Winning headers not applied locally yet, in application order
    pub apply: Vec<DatabaseVersionHeader>,
}

impl ReconcileOutcome {
    /// True if the local branch already is the winner
    pub fn is_noop(&self) -> bool {
        self.prune.is_empty() && self.apply.is_empty()
    }

    /// Pruned headers produced by `client`
    pub fn pruned_of<'a>(&'a self, client: &'a str) -> impl Iterator<Item = &'a DatabaseVersionHeader> + 'a {
        self.prune.iter().filter(move |h| h.client == client)
    }
}

/// Build the local branch and one branch per remote client.
///
/// Fails if two different headers claim the same client and sequence.
pub fn build_branches(
    local_client: &str,
    local: &[DatabaseVersionHeader],
    remote: &[DatabaseVersionHeader],
    cmp: &HeaderComparator,
) -> Result<BTreeMap<String, Branch>> {
    let mut by_id: BTreeMap<(String, u64), &DatabaseVersionHeader> = BTreeMap::new();
    for header in local.iter().chain(remote) {
        let id = (header.client.clone(), header.sequence());
        match by_id.get(&id) {
            Some(existing) if *existing != header => {
                return Err(SyncError::ConflictResolution {
                    reason: format!(
                        "two different database versions claim {}-{}: {} and {}",
                        id.0, id.1, existing, header
                    ),
                });
            }
            Some(_) => {}
            None => {
                by_id.insert(id, header);
            }
        }
    }
    let all: Vec<&DatabaseVersionHeader> = by_id.into_values().collect();

    let mut branches = BTreeMap::new();
    let mut local_branch = local.to_vec();
    cmp.sort(&mut local_branch);
    branches.insert(local_client.to_string(), local_branch);

    let remote_clients: BTreeSet<&str> = remote
        .iter()
        .map(|h| h.client.as_str())
        .filter(|c| *c != local_client)
        .collect();
    for client in remote_clients {
        let tip = all
            .iter()
            .filter(|h| h.client == client)
            .max_by_key(|h| h.sequence())
            .map(|h| h.vector_clock.clone());
        let Some(tip) = tip else { continue };
        let mut branch: Branch = all
            .iter()
            .filter(|h| h.vector_clock.le(&tip))
            .map(|h| (*h).clone())
            .collect();
        cmp.sort(&mut branch);
        branches.insert(client.to_string(), branch);
    }
    Ok(branches)
}

/// Pick the winning branch and derive what to prune and what to apply.
#[instrument(skip(local, remote, cmp), fields(local = local.len(), remote = remote.len()))]
pub fn reconcile(
    local_client: &str,
    local: &[DatabaseVersionHeader],
    remote: &[DatabaseVersionHeader],
    cmp: &HeaderComparator,
) -> Result<ReconcileOutcome> {
    let branches = build_branches(local_client, local, remote, cmp)?;

    let mut contenders: Vec<&String> = branches.keys().collect();
    let mut position = 0usize;
    while contenders.len() > 1 {
        let active: Vec<&String> = contenders
            .iter()
            .copied()
            .filter(|c| branches[*c].len() > position)
            .collect();
        if active.is_empty() {
            break;
        }
        contenders = active;
        if contenders.len() == 1 {
            break;
        }
        let winner = cmp
            .winner(contenders.iter().map(|c| &branches[*c][position]))
            .cloned()
            .ok_or_else(|| SyncError::ConflictResolution {
                reason: format!("no candidate header at position {}", position),
            })?;
        contenders.retain(|c| branches[*c][position] == winner);
        debug!(position, winner = %winner, remaining = contenders.len(), "branch position decided");
        position += 1;
    }

    let winner_client = contenders
        .first()
        .map(|c| (*c).clone())
        .ok_or_else(|| SyncError::ConflictResolution {
            reason: "no branches to reconcile".into(),
        })?;
    let winner_branch = branches[&winner_client].clone();

    let winning: HashSet<&DatabaseVersionHeader> = winner_branch.iter().collect();
    let local_set: HashSet<&DatabaseVersionHeader> = local.iter().collect();
    let prune: Vec<DatabaseVersionHeader> = branches[local_client]
        .iter()
        .filter(|h| !winning.contains(h))
        .cloned()
        .collect();
    let apply: Vec<DatabaseVersionHeader> = winner_branch
        .iter()
        .filter(|h| !local_set.contains(h))
        .cloned()
        .collect();

    info!(
        winner = %winner_client,
        prune = prune.len(),
        apply = apply.len(),
        "reconciliation finished"
    );
    Ok(ReconcileOutcome {
        winner_client,
        winner_branch,
        prune,
        apply,
    })
}

/// Reconciliation state of one file history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HistoryState {
    /// Not touched by this cycle
    Unchanged,
    /// Touched by a downloaded or pruned version
    Candidate,
    /// The winning version of the history is known
    WinnerDetermined,
    /// Filesystem actions were planned
    ActionPlanned,
    /// Disk reached the winning state
    Applied,
    /// An action failed; disk keeps its previous state
    Skipped,
    /// A local divergence was preserved as a conflict copy
    Conflicted,
}

impl HistoryState {
    fn is_terminal(self) -> bool {
        matches!(self, HistoryState::Applied | HistoryState::Skipped | HistoryState::Conflicted)
    }
}

/// Tracks every touched history through the reconciliation states.
///
/// States only move forward; a terminal state is never left.
#[derive(Debug, Clone, Default)]
pub struct HistoryTracker {
    states: BTreeMap<FileHistoryId, HistoryState>,
}

impl HistoryTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `id`
    pub fn state(&self, id: &FileHistoryId) -> HistoryState {
        self.states.get(id).copied().unwrap_or(HistoryState::Unchanged)
    }

    /// Move `id` to `next` if that is a forward move; returns whether it moved
    pub fn advance(&mut self, id: FileHistoryId, next: HistoryState) -> bool {
        let current = self.state(&id);
        if current.is_terminal() || next <= current {
            return false;
        }
        self.states.insert(id, next);
        true
    }

    /// Move every history still in `from` to `to`
    pub fn advance_all(&mut self, from: HistoryState, to: HistoryState) {
        let ids: Vec<FileHistoryId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == from)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.advance(id, to);
        }
    }

    /// Histories in `state`
    pub fn in_state(&self, state: HistoryState) -> Vec<FileHistoryId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Count per state
    pub fn summary(&self) -> BTreeMap<HistoryState, usize> {
        let mut out = BTreeMap::new();
        for state in self.states.values() {
            *out.entry(*state).or_insert(0) += 1;
        }
        out
    }

    /// Number of tracked histories
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True if no history is tracked
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
