//! Vector clocks: per-client logical counters with partial-order comparison.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorClockComparison {
    /// Every counter is identical.
    Equal,
    /// Every counter is less or equal, at least one strictly less.
    Smaller,
    /// Every counter is greater or equal, at least one strictly greater.
    Greater,
    /// Neither clock dominates.
    Simultaneous,
}

impl VectorClockComparison {
    /// The comparison seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            VectorClockComparison::Smaller => VectorClockComparison::Greater,
            VectorClockComparison::Greater => VectorClockComparison::Smaller,
            other => other,
        }
    }
}

/// Mapping from client id to logical counter. Missing clients count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// An empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `client`, zero if absent.
    pub fn get(&self, client: &str) -> u64 {
        self.0.get(client).copied().unwrap_or(0)
    }

    /// Set the counter for `client`. Setting zero removes the entry.
    pub fn set(&mut self, client: &str, value: u64) {
        if value == 0 {
            self.0.remove(client);
        } else {
            self.0.insert(client.to_string(), value);
        }
    }

    /// Increment the counter for `client` and return the new value.
    pub fn increment(&mut self, client: &str) -> u64 {
        let next = self.get(client) + 1;
        self.0.insert(client.to_string(), next);
        next
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &value) in &other.0 {
            let entry = self.0.entry(client.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Clients with a non-zero counter, in order.
    pub fn clients(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// (client, counter) pairs in client order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True if no client has a counter.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    /// Compare `self` against `other` under the vector-clock partial order.
    pub fn compare(&self, other: &VectorClock) -> VectorClockComparison {
        let mut less = false;
        let mut greater = false;
        for client in self.0.keys().chain(other.0.keys()) {
            let a = self.get(client);
            let b = other.get(client);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
            if less && greater {
                return VectorClockComparison::Simultaneous;
            }
        }
        match (less, greater) {
            (false, false) => VectorClockComparison::Equal,
            (true, false) => VectorClockComparison::Smaller,
            (false, true) => VectorClockComparison::Greater,
            (true, true) => VectorClockComparison::Simultaneous,
        }
    }

    /// True if `self` is smaller than or equal to `other`.
    pub fn le(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            VectorClockComparison::Smaller | VectorClockComparison::Equal
        )
    }
}

impl fmt::Display for VectorClock {
    /// Canonical form, e.g. `(A1,B3)`. Zero counters are omitted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for (client, value) in self.0.iter().filter(|(_, v)| **v > 0) {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}{}", client, value)?;
            first = false;
        }
        write!(f, ")")
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (client, value) in iter {
            clock.set(&client.into(), value);
        }
        clock
    }
}
