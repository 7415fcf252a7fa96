//! Deterministic total order over database version headers.
//!
//! Causal order comes first. Headers whose clocks are equal or concurrent are
//! ordered by a tie-break so that every client sorts the same headers the
//! same way.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::DatabaseVersionHeader;
use crate::vector_clock::VectorClockComparison;

/// How concurrent headers are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Earlier timestamp first, then client id, then canonical clock.
    #[default]
    ConsiderTime,
    /// Client id first, then canonical clock; wall-clock time is ignored.
    IgnoreTime,
}

/// Comparator over [`DatabaseVersionHeader`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderComparator {
    tie_break: TieBreak,
}

impl HeaderComparator {
    /// Comparator with the given tie-break mode
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Active tie-break mode
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Order two headers. A dominating clock sorts after the dominated one.
    pub fn compare(&self, a: &DatabaseVersionHeader, b: &DatabaseVersionHeader) -> Ordering {
        match a.vector_clock.compare(&b.vector_clock) {
            VectorClockComparison::Smaller => Ordering::Less,
            VectorClockComparison::Greater => Ordering::Greater,
            VectorClockComparison::Equal | VectorClockComparison::Simultaneous => {
                self.break_tie(a, b)
            }
        }
    }

    /// Tie-break only, ignoring causality
    pub fn break_tie(&self, a: &DatabaseVersionHeader, b: &DatabaseVersionHeader) -> Ordering {
        let by_time = match self.tie_break {
            TieBreak::ConsiderTime => a.timestamp.cmp(&b.timestamp),
            TieBreak::IgnoreTime => Ordering::Equal,
        };
        by_time
            .then_with(|| a.client.cmp(&b.client))
            .then_with(|| a.vector_clock.to_string().cmp(&b.vector_clock.to_string()))
    }

    /// Sort headers into a deterministic sequence.
    ///
    /// The tie-break is not consistent with causality across more than two
    /// headers, so this is a topological sort that always emits the
    /// tie-break minimum among the headers whose causal predecessors are out.
    pub fn sort(&self, headers: &mut [DatabaseVersionHeader]) {
        let n = headers.len();
        let mut preds = vec![0usize; n];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if headers[i].vector_clock.compare(&headers[j].vector_clock)
                    == VectorClockComparison::Smaller
                {
                    succs[i].push(j);
                    preds[j] += 1;
                }
            }
        }
        let mut ready: Vec<usize> = (0..n).filter(|&i| preds[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while !ready.is_empty() {
            let mut best = 0;
            for k in 1..ready.len() {
                if self.break_tie(&headers[ready[k]], &headers[ready[best]]) == Ordering::Less {
                    best = k;
                }
            }
            let next = ready.swap_remove(best);
            order.push(next);
            for &s in &succs[next] {
                preds[s] -= 1;
                if preds[s] == 0 {
                    ready.push(s);
                }
            }
        }
        let sorted: Vec<DatabaseVersionHeader> = order.into_iter().map(|i| headers[i].clone()).collect();
        headers.clone_from_slice(&sorted);
    }

    /// Of several candidates, the one that wins: among those no other
    /// candidate dominates, the tie-break minimum
    pub fn winner<'a, I>(&self, candidates: I) -> Option<&'a DatabaseVersionHeader>
    where
        I: IntoIterator<Item = &'a DatabaseVersionHeader>,
    {
        let all: Vec<&'a DatabaseVersionHeader> = candidates.into_iter().collect();
        all.iter()
            .copied()
            .filter(|h| {
                !all.iter().any(|o| {
                    o.vector_clock.compare(&h.vector_clock) == VectorClockComparison::Greater
                })
            })
            .min_by(|a, b| self.break_tie(a, b))
    }
}
