use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state_table::{CallEvent, CallState};

/// Counters for the state machine, including how often each unmapped
/// (state, event) pair was seen
#[derive(Debug, Default)]
pub struct TransitionStats {
    applied: AtomicU64,
    internal: AtomicU64,
    ignored: AtomicU64,
    not_found: AtomicU64,
    conflicts: AtomicU64,
    ignored_pairs: DashMap<(CallState, CallEvent), u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionStatsSnapshot {
    pub applied: u64,
    pub internal: u64,
    pub ignored: u64,
    pub not_found: u64,
    /// Compare-and-set conflicts that forced a re-read
    pub conflicts: u64,
    /// Keyed `STATE+EVENT`
    pub ignored_pairs: BTreeMap<String, u64>,
}

impl TransitionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_internal(&self) {
        self.internal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self, state: CallState, event: CallEvent) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
        *self.ignored_pairs.entry((state, event)).or_insert(0) += 1;
    }

    pub fn ignored_count(&self, state: CallState, event: CallEvent) -> u64 {
        self.ignored_pairs.get(&(state, event)).map_or(0, |c| *c)
    }

    pub fn snapshot(&self) -> TransitionStatsSnapshot {
        TransitionStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            internal: self.internal.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            ignored_pairs: self
                .ignored_pairs
                .iter()
                .map(|e| {
                    let (state, event) = e.key();
                    (format!("{}+{}", state, event), *e.value())
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignored_pairs_are_counted_per_pair() {
        let stats = TransitionStats::new();
        stats.record_ignored(CallState::Ended, CallEvent::Bye);
        stats.record_ignored(CallState::Ended, CallEvent::Bye);
        stats.record_ignored(CallState::Ringing, CallEvent::Progress);
        stats.record_applied();

        assert_eq!(stats.ignored_count(CallState::Ended, CallEvent::Bye), 2);

        let snap = stats.snapshot();
        assert_eq!(snap.ignored, 3);
        assert_eq!(snap.applied, 1);
        assert_eq!(snap.ignored_pairs.get("ENDED+BYE"), Some(&2));
        assert_eq!(snap.ignored_pairs.get("RINGING+PROGRESS"), Some(&1));
    }
}
