//! Entry point of the write pipeline.

use crate::buffer::{CallBuffer, PreFlushHook};
use crate::config::{BufferConfiguration, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::monitor::Monitor;
use crate::pool::WorkerPool;
use crate::stats::PipelineMetrics;
use crate::writer::{AsyncWriter, BulkWriter, PartitionLocator, SyncWriter, Writer};
use sitx_core::TxnView;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Creates call buffers over one transport and owns what they share: the
/// async worker pool, both writers and the [`Monitor`].
pub struct WriteCoordinator {
    config: PipelineConfig,
    monitor: Arc<Monitor>,
    pool: Arc<WorkerPool>,
    async_writer: Arc<AsyncWriter>,
    sync_writer: Arc<SyncWriter>,
    shut_down: AtomicBool,
}

impl WriteCoordinator {
    /// Creates a coordinator writing through `transport`.
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn BulkWriter>,
        locator: Arc<dyn PartitionLocator>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new("sitx-flush", config.max_async_threads));
        let async_writer = Arc::new(AsyncWriter::new(
            Arc::clone(&transport),
            Arc::clone(&locator),
            config.clone(),
            Arc::clone(&pool),
        ));
        let sync_writer = Arc::new(SyncWriter::new(transport, locator, config.clone()));
        Self {
            config,
            monitor: Arc::new(Monitor::new()),
            pool,
            async_writer,
            sync_writer,
            shut_down: AtomicBool::new(false),
        }
    }

    /// The configuration buffers are created with.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The shared monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Opens a buffer flushing on the async pool.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown).
    pub fn write_buffer(&self, partition: &str, txn: &TxnView) -> PipelineResult<CallBuffer> {
        self.open(partition, txn, self.async_writer(), self.config.buffer_configuration(), None)
    }

    /// Opens an async buffer flushing every `max_entries` rows.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown).
    pub fn write_buffer_with_max_entries(
        &self,
        partition: &str,
        txn: &TxnView,
        max_entries: usize,
    ) -> PipelineResult<CallBuffer> {
        let config = self.config.buffer_configuration().max_entries(max_entries);
        self.open(partition, txn, self.async_writer(), config, None)
    }

    /// Opens an async buffer whose batches pass through `hook`.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown).
    pub fn write_buffer_with_hook(
        &self,
        partition: &str,
        txn: &TxnView,
        hook: Arc<dyn PreFlushHook>,
    ) -> PipelineResult<CallBuffer> {
        self.open(
            partition,
            txn,
            self.async_writer(),
            self.config.buffer_configuration(),
            Some(hook),
        )
    }

    /// Opens a buffer whose flushes block the caller.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown).
    pub fn synchronous_write_buffer(
        &self,
        partition: &str,
        txn: &TxnView,
    ) -> PipelineResult<CallBuffer> {
        self.open(partition, txn, self.sync_writer(), self.config.buffer_configuration(), None)
    }

    /// Opens a synchronous buffer whose batches pass through `hook`.
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown).
    pub fn synchronous_write_buffer_with_hook(
        &self,
        partition: &str,
        txn: &TxnView,
        hook: Arc<dyn PreFlushHook>,
    ) -> PipelineResult<CallBuffer> {
        self.open(
            partition,
            txn,
            self.sync_writer(),
            self.config.buffer_configuration(),
            Some(hook),
        )
    }

    fn async_writer(&self) -> Arc<dyn Writer> {
        self.async_writer.clone()
    }

    fn sync_writer(&self) -> Arc<dyn Writer> {
        self.sync_writer.clone()
    }

    fn open(
        &self,
        partition: &str,
        txn: &TxnView,
        writer: Arc<dyn Writer>,
        config: BufferConfiguration,
        hook: Option<Arc<dyn PreFlushHook>>,
    ) -> PipelineResult<CallBuffer> {
        if self.is_shut_down() {
            return Err(PipelineError::Shutdown);
        }
        let buffer = CallBuffer::new(partition, txn.clone(), config, writer, Arc::clone(&self.monitor))
            .with_backpressure(self.config.backpressure);
        Ok(match hook {
            Some(hook) => buffer.with_hook(hook),
            None => buffer,
        })
    }

    /// Async pool thread limit.
    #[must_use]
    pub fn max_async_threads(&self) -> usize {
        self.pool.max_workers()
    }

    /// Changes the async pool thread limit at runtime.
    pub fn set_max_async_threads(&self, threads: usize) {
        self.pool.set_max_workers(threads);
    }

    /// Snapshot of buffer accounting and writer counters.
    #[must_use]
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            monitor: self.monitor.snapshot(),
            async_writer: self.async_writer.stats(),
            sync_writer: self.sync_writer.stats(),
            max_async_threads: self.pool.max_workers(),
            async_threads: self.pool.worker_count(),
            queued_flushes: self.pool.queued_jobs(),
        }
    }

    /// Stops creating buffers and lets every queued async flush finish.
    ///
    /// Buffers still open afterwards can no longer flush asynchronously;
    /// their remaining rows fail with `Shutdown` when closed.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.shutdown();
        info!(
            outstanding_buffers = self.monitor.outstanding_buffers(),
            "write coordinator shut down"
        );
    }

    /// Returns true after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitx_core::{OperationStatus, Timestamp, TxnId};
    use sitx_storage::KvPair;
    use std::time::Duration;

    struct AlwaysOk;

    impl BulkWriter for AlwaysOk {
        fn write(
            &self,
            _partition: &str,
            _txn: &TxnView,
            rows: &[KvPair],
        ) -> PipelineResult<Vec<OperationStatus>> {
            Ok(vec![OperationStatus::Success; rows.len()])
        }
    }

    struct Single;

    impl PartitionLocator for Single {
        fn locate(&self, _row_key: &[u8]) -> PipelineResult<String> {
            Ok("only".into())
        }
    }

    fn coordinator() -> WriteCoordinator {
        WriteCoordinator::new(
            PipelineConfig::new()
                .client_pause(Duration::ZERO)
                .max_async_threads(2),
            Arc::new(AlwaysOk),
            Arc::new(Single),
        )
    }

    fn txn() -> TxnView {
        TxnView::new(TxnId(3), Timestamp(3))
    }

    #[test]
    fn async_and_sync_buffers_report_every_row() {
        let coordinator = coordinator();
        let mut async_buffer = coordinator.write_buffer_with_max_entries("only", &txn(), 2).unwrap();
        let mut sync_buffer = coordinator.synchronous_write_buffer("only", &txn()).unwrap();
        assert_eq!(coordinator.monitor().outstanding_buffers(), 2);

        for i in 0..5u8 {
            async_buffer.add(KvPair::upsert(vec![i], vec![i])).unwrap();
            sync_buffer.add(KvPair::upsert(vec![i], vec![i])).unwrap();
        }
        let mut async_statuses = async_buffer.take_completed();
        async_statuses.extend(async_buffer.close());
        let sync_statuses = sync_buffer.close();

        assert_eq!(async_statuses.len(), 5);
        assert_eq!(sync_statuses.len(), 5);
        let metrics = coordinator.metrics();
        assert_eq!(metrics.monitor.outstanding_buffers, 0);
        assert_eq!(metrics.async_writer.flushes, 3);
        assert_eq!(metrics.sync_writer.flushes, 1);
        assert_eq!(metrics.writers_total().rows_written, 10);
    }

    #[test]
    fn resizes_async_pool() {
        let coordinator = coordinator();
        assert_eq!(coordinator.max_async_threads(), 2);
        coordinator.set_max_async_threads(7);
        assert_eq!(coordinator.max_async_threads(), 7);
        assert_eq!(coordinator.metrics().max_async_threads, 7);
    }

    #[test]
    fn shutdown_stops_admission_but_finishes_flushes() {
        let coordinator = coordinator();
        let mut buffer = coordinator.write_buffer("only", &txn()).unwrap();
        buffer.add(KvPair::upsert(&b"k"[..], &b"v"[..])).unwrap();
        buffer.flush().unwrap();

        coordinator.shutdown();
        assert!(matches!(
            coordinator.write_buffer("only", &txn()),
            Err(PipelineError::Shutdown)
        ));

        buffer.add(KvPair::upsert(&b"late"[..], &b"v"[..])).unwrap();
        let statuses = buffer.close();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, OperationStatus::Success);
        assert!(matches!(statuses[1].status, OperationStatus::Failure(_)));
        coordinator.shutdown();
    }
}
