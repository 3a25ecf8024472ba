//! Writer counters and the pipeline metrics snapshot.

use crate::monitor::MonitorSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Flush and retry counters of one writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    flushes: AtomicU64,
    batches: AtomicU64,
    rows_written: AtomicU64,
    retried_rows: AtomicU64,
    failed_rows: AtomicU64,
}

impl WriterStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, rows: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retries(&self, rows: usize) {
        self.retried_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failures(&self, rows: usize) {
        self.failed_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            retried_rows: self.retried_rows.load(Ordering::Relaxed),
            failed_rows: self.failed_rows.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WriterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStatsSnapshot {
    /// Flushes submitted to the writer.
    pub flushes: u64,
    /// Per-partition batches sent to the transport, retries included.
    pub batches: u64,
    /// Rows sent to the transport, retries included.
    pub rows_written: u64,
    /// Rows sent again after a retryable status.
    pub retried_rows: u64,
    /// Rows whose final status was not a success.
    pub failed_rows: u64,
}

impl WriterStatsSnapshot {
    /// Adds `other` into `self`.
    pub fn accumulate(&mut self, other: &Self) {
        self.flushes += other.flushes;
        self.batches += other.batches;
        self.rows_written += other.rows_written;
        self.retried_rows += other.retried_rows;
        self.failed_rows += other.failed_rows;
    }
}

/// Everything a coordinator exposes for management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    /// Buffer accounting.
    pub monitor: MonitorSnapshot,
    /// Counters of the asynchronous writer.
    pub async_writer: WriterStatsSnapshot,
    /// Counters of the synchronous writer.
    pub sync_writer: WriterStatsSnapshot,
    /// Async pool thread limit.
    pub max_async_threads: usize,
    /// Async pool threads alive.
    pub async_threads: usize,
    /// Flush jobs waiting for an async thread.
    pub queued_flushes: usize,
}

impl PipelineMetrics {
    /// Both writers' counters summed.
    #[must_use]
    pub fn writers_total(&self) -> WriterStatsSnapshot {
        let mut total = self.async_writer;
        total.accumulate(&self.sync_writer);
        total
    }
}
