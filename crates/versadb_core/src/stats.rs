//! Engine statistics.
//!
//! Counters are atomic and can be read while operations are in progress.
//! Gauges (pending writes, held locks, ...) are sampled when a snapshot is
//! taken.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    refused: AtomicU64,
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    transported: AtomicU64,
    backups_replayed: AtomicU64,
    errors: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transported(&self, count: usize) {
        self.transported.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_backup_replayed(&self) {
        self.backups_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Writes accepted into the pipeline.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Writes rejected as already applied.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Calls refused because the engine was not serving.
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    /// Transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Transactions aborted, explicitly, by drop or by a failed commit.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Writes moved from the buffer to the database.
    pub fn transported(&self) -> u64 {
        self.transported.load(Ordering::Relaxed)
    }

    /// Sealed backups replayed at open.
    pub fn backups_replayed(&self) -> u64 {
        self.backups_replayed.load(Ordering::Relaxed)
    }

    /// Background errors.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A point-in-time view of engine activity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Writes accepted into the pipeline.
    pub accepted: u64,
    /// Writes rejected as already applied.
    pub duplicates: u64,
    /// Calls refused because the engine was not serving.
    pub refused: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Writes moved from the buffer to the database.
    pub transported: u64,
    /// Sealed backups replayed at open.
    pub backups_replayed: u64,
    /// Background errors.
    pub errors: u64,
    /// Writes waiting in the buffer.
    pub pending: usize,
    /// Revisions in the database.
    pub revisions: usize,
    /// Outstanding lock grants.
    pub locks_held: usize,
}

impl EngineStats {
    /// Copies the counters into a snapshot with zeroed gauges.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted(),
            duplicates: self.duplicates(),
            refused: self.refused(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            transported: self.transported(),
            backups_replayed: self.backups_replayed(),
            errors: self.errors(),
            ..StatsSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::new();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_duplicate();
        stats.record_transported(5);
        stats.record_transaction_start();
        stats.record_transaction_commit();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.transported, 5);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.pending, 0);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(EngineStats::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_accepted();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.accepted(), 1000);
    }
}
