//! Transaction store statistics.
//!
//! All counters are atomic and can be read while operations are in progress.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a [`TxnStore`](crate::TxnStore).
#[derive(Debug, Default)]
pub struct TxnStats {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    global_commits: AtomicU64,
    keep_alives: AtomicU64,
    protocol_violations: AtomicU64,
    replayed_records: AtomicU64,
}

impl TxnStats {
    /// Creates a new stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_begin(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_global_commit(&self) {
        self.global_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_keep_alive(&self) {
        self.keep_alives.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, count: u64) {
        self.replayed_records.fetch_add(count, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            global_commits: self.global_commits.load(Ordering::Relaxed),
            keep_alives: self.keep_alives.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            replayed_records: self.replayed_records.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TxnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnStatsSnapshot {
    /// Transactions recorded.
    pub begun: u64,
    /// Commits recorded.
    pub committed: u64,
    /// Rollbacks recorded.
    pub rolled_back: u64,
    /// Global commit timestamps cached.
    pub global_commits: u64,
    /// Keep-alives accepted.
    pub keep_alives: u64,
    /// Rejected duplicate records and illegal transitions.
    pub protocol_violations: u64,
    /// Log records replayed on open.
    pub replayed_records: u64,
}

impl TxnStatsSnapshot {
    /// Adds another snapshot's counters into this one.
    pub fn accumulate(&mut self, other: &Self) {
        self.begun += other.begun;
        self.committed += other.committed;
        self.rolled_back += other.rolled_back;
        self.global_commits += other.global_commits;
        self.keep_alives += other.keep_alives;
        self.protocol_violations += other.protocol_violations;
        self.replayed_records += other.replayed_records;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TxnStats::new();
        stats.record_begin();
        stats.record_begin();
        stats.record_commit();
        stats.record_protocol_violation();

        let mut total = stats.snapshot();
        assert_eq!(total.begun, 2);
        assert_eq!(total.committed, 1);

        total.accumulate(&stats.snapshot());
        assert_eq!(total.begun, 4);
        assert_eq!(total.protocol_violations, 2);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let stats = TxnStats::new();
        stats.record_rollback();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["rolledBack"], 1);
    }
}
