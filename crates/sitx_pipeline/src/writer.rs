//! Writers: deliver a flush to the partitions, retrying per row.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::pool::WorkerPool;
use crate::stats::{WriterStats, WriterStatsSnapshot};
use sitx_core::{OperationStatus, TxnView};
use sitx_storage::KvPair;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Sends one batch of rows to one partition.
pub trait BulkWriter: Send + Sync {
    /// Applies `rows` on behalf of `txn`, returning one status per row in
    /// input order.
    ///
    /// # Errors
    ///
    /// An error means the batch was not delivered; every row of it is
    /// treated as a generic failure and may be retried.
    fn write(
        &self,
        partition: &str,
        txn: &TxnView,
        rows: &[KvPair],
    ) -> PipelineResult<Vec<OperationStatus>>;
}

/// Maps a row key to the partition currently holding it.
pub trait PartitionLocator: Send + Sync {
    /// Returns the partition of `row_key`.
    ///
    /// # Errors
    ///
    /// An error fails the row for this attempt.
    fn locate(&self, row_key: &[u8]) -> PipelineResult<String>;
}

impl<T: BulkWriter + ?Sized> BulkWriter for Arc<T> {
    fn write(
        &self,
        partition: &str,
        txn: &TxnView,
        rows: &[KvPair],
    ) -> PipelineResult<Vec<OperationStatus>> {
        (**self).write(partition, txn, rows)
    }
}

impl<T: PartitionLocator + ?Sized> PartitionLocator for Arc<T> {
    fn locate(&self, row_key: &[u8]) -> PipelineResult<String> {
        (**self).locate(row_key)
    }
}

/// Delivers a flush and hands back per-row statuses.
pub trait Writer: Send + Sync {
    /// Submits `rows`.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the writer no longer accepts work.
    fn submit(&self, txn: &TxnView, rows: Vec<KvPair>) -> PipelineResult<FlushHandle>;

    /// Counters of this writer.
    fn stats(&self) -> WriterStatsSnapshot;
}

/// Per-row statuses of one flush.
pub type FlushResult = PipelineResult<Vec<OperationStatus>>;

enum FlushState {
    Done(FlushResult),
    Waiting(Receiver<FlushResult>),
}

/// Result of one submitted flush, possibly still running.
pub struct FlushHandle {
    state: FlushState,
}

impl FlushHandle {
    /// A flush that has already finished.
    #[must_use]
    pub fn ready(result: FlushResult) -> Self {
        Self {
            state: FlushState::Done(result),
        }
    }

    /// A flush whose result arrives on `receiver`.
    #[must_use]
    pub fn pending(receiver: Receiver<FlushResult>) -> Self {
        Self {
            state: FlushState::Waiting(receiver),
        }
    }

    /// Returns true if the flush has finished. Never blocks.
    pub fn is_done(&mut self) -> bool {
        let outcome = match &self.state {
            FlushState::Done(_) => None,
            FlushState::Waiting(receiver) => match receiver.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => Some(Err(PipelineError::WorkerLost)),
            },
        };
        if let Some(result) = outcome {
            self.state = FlushState::Done(result);
        }
        true
    }

    /// Blocks until the flush finishes.
    ///
    /// # Errors
    ///
    /// `WorkerLost` if the job ended without a result.
    pub fn wait(self) -> FlushResult {
        match self.state {
            FlushState::Done(result) => result,
            FlushState::Waiting(receiver) => receiver.recv().unwrap_or(Err(PipelineError::WorkerLost)),
        }
    }
}

/// Shared retry loop of both writers.
struct RetryingFlusher {
    transport: Arc<dyn BulkWriter>,
    locator: Arc<dyn PartitionLocator>,
    config: PipelineConfig,
    stats: WriterStats,
}

impl RetryingFlusher {
    /// Sends `rows` until every row has a final status.
    ///
    /// Rows are grouped by partition in submission order. A row whose status
    /// is retryable is located again and resent after the backoff pause,
    /// at most `max_retries` times; its last status is final.
    fn flush(&self, txn: &TxnView, rows: &[KvPair]) -> Vec<OperationStatus> {
        self.stats.record_flush();
        let mut statuses = vec![OperationStatus::NotRun; rows.len()];
        let mut pending: Vec<usize> = (0..rows.len()).collect();
        let mut attempt = 0u32;

        loop {
            let mut retry = Vec::new();
            let mut by_partition: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for index in pending {
                match self.locator.locate(rows[index].row_key()) {
                    Ok(partition) => by_partition.entry(partition).or_default().push(index),
                    Err(err) => {
                        statuses[index] = OperationStatus::failure(err.to_string());
                        retry.push(index);
                    }
                }
            }

            for (partition, indexes) in by_partition {
                let batch: Vec<KvPair> = indexes.iter().map(|&i| rows[i].clone()).collect();
                self.stats.record_batch(batch.len());
                let results = match self.transport.write(&partition, txn, &batch) {
                    Ok(results) if results.len() == batch.len() => results,
                    Ok(results) => vec![
                        OperationStatus::failure(format!(
                            "{partition} returned {} statuses for {} rows",
                            results.len(),
                            batch.len()
                        ));
                        batch.len()
                    ],
                    Err(err) => vec![OperationStatus::failure(err.to_string()); batch.len()],
                };
                for (index, status) in indexes.into_iter().zip(results) {
                    if status.is_retryable() {
                        retry.push(index);
                    }
                    statuses[index] = status;
                }
            }

            if retry.is_empty() || attempt >= self.config.max_retries {
                break;
            }
            retry.sort_unstable();
            let pause = self.config.pause_for(attempt);
            debug!(txn = %txn.txn_id, rows = retry.len(), attempt, ?pause, "retrying rows");
            self.stats.record_retries(retry.len());
            sleep(pause);
            attempt += 1;
            pending = retry;
        }

        let failed = statuses.iter().filter(|s| !s.is_success()).count();
        self.stats.record_failures(failed);
        statuses
    }
}

fn sleep(pause: Duration) {
    if !pause.is_zero() {
        thread::sleep(pause);
    }
}

/// Flushes on a [`WorkerPool`]; `submit` never blocks the producer.
pub struct AsyncWriter {
    flusher: Arc<RetryingFlusher>,
    pool: Arc<WorkerPool>,
}

impl AsyncWriter {
    /// Creates a writer running flushes on `pool`.
    pub fn new(
        transport: Arc<dyn BulkWriter>,
        locator: Arc<dyn PartitionLocator>,
        config: PipelineConfig,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            flusher: Arc::new(RetryingFlusher {
                transport,
                locator,
                config,
                stats: WriterStats::new(),
            }),
            pool,
        }
    }
}

impl Writer for AsyncWriter {
    fn submit(&self, txn: &TxnView, rows: Vec<KvPair>) -> PipelineResult<FlushHandle> {
        let (sender, receiver) = mpsc::channel();
        let flusher = Arc::clone(&self.flusher);
        let txn = txn.clone();
        self.pool.execute(move || {
            let statuses = flusher.flush(&txn, &rows);
            let _ = sender.send(Ok(statuses));
        })?;
        Ok(FlushHandle::pending(receiver))
    }

    fn stats(&self) -> WriterStatsSnapshot {
        self.flusher.stats.snapshot()
    }
}

/// Flushes on the calling thread.
pub struct SyncWriter {
    flusher: RetryingFlusher,
}

impl SyncWriter {
    /// Creates a writer over `transport`.
    pub fn new(
        transport: Arc<dyn BulkWriter>,
        locator: Arc<dyn PartitionLocator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            flusher: RetryingFlusher {
                transport,
                locator,
                config,
                stats: WriterStats::new(),
            },
        }
    }
}

impl Writer for SyncWriter {
    fn submit(&self, txn: &TxnView, rows: Vec<KvPair>) -> PipelineResult<FlushHandle> {
        Ok(FlushHandle::ready(Ok(self.flusher.flush(txn, &rows))))
    }

    fn stats(&self) -> WriterStatsSnapshot {
        self.flusher.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sitx_core::{FailureKind, Timestamp, TxnId};

    /// Partition is the first byte of the key; statuses are scripted per key
    /// and attempt, defaulting to success.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<BTreeMap<Vec<u8>, Vec<OperationStatus>>>,
        calls: Mutex<Vec<(String, Vec<Vec<u8>>)>>,
    }

    impl Scripted {
        fn on(self, key: &[u8], statuses: Vec<OperationStatus>) -> Self {
            self.script.lock().insert(key.to_vec(), statuses);
            self
        }
    }

    impl BulkWriter for Scripted {
        fn write(
            &self,
            partition: &str,
            _txn: &TxnView,
            rows: &[KvPair],
        ) -> PipelineResult<Vec<OperationStatus>> {
            self.calls.lock().push((
                partition.to_string(),
                rows.iter().map(|kv| kv.row_key().to_vec()).collect(),
            ));
            let mut script = self.script.lock();
            Ok(rows
                .iter()
                .map(|kv| match script.get_mut(&kv.row_key()[..]) {
                    Some(queue) if !queue.is_empty() => queue.remove(0),
                    _ => OperationStatus::Success,
                })
                .collect())
        }
    }

    struct FirstByte;

    impl PartitionLocator for FirstByte {
        fn locate(&self, row_key: &[u8]) -> PipelineResult<String> {
            row_key
                .first()
                .map(|b| format!("p{}", char::from(*b)))
                .ok_or_else(|| PipelineError::locate("empty key"))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new()
            .client_pause(Duration::ZERO)
            .max_retries(2)
    }

    fn txn() -> TxnView {
        TxnView::new(TxnId(1), Timestamp(1))
    }

    fn rows(keys: &[&'static [u8]]) -> Vec<KvPair> {
        keys.iter().map(|k| KvPair::upsert(*k, &b"v"[..])).collect()
    }

    #[test]
    fn groups_by_partition_in_submission_order() {
        let transport = Arc::new(Scripted::default());
        let writer = SyncWriter::new(transport.clone(), Arc::new(FirstByte), config());

        let statuses = writer
            .submit(&txn(), rows(&[b"a1", b"b1", b"a2", b"b2"]))
            .unwrap()
            .wait()
            .unwrap();
        assert!(statuses.iter().all(OperationStatus::is_success));

        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("pa".into(), vec![b"a1".to_vec(), b"a2".to_vec()]));
        assert_eq!(calls[1], ("pb".into(), vec![b"b1".to_vec(), b"b2".to_vec()]));
    }

    #[test]
    fn retries_only_retryable_rows() {
        let transport = Arc::new(
            Scripted::default()
                .on(b"a1", vec![OperationStatus::NotRun])
                .on(b"a2", vec![OperationStatus::write_conflict("taken")]),
        );
        let writer = SyncWriter::new(transport.clone(), Arc::new(FirstByte), config());

        let statuses = writer
            .submit(&txn(), rows(&[b"a1", b"a2", b"a3"]))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(statuses[0], OperationStatus::Success);
        assert!(matches!(&statuses[1], OperationStatus::Failure(f) if f.kind() == FailureKind::WriteConflict));
        assert_eq!(statuses[2], OperationStatus::Success);

        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, vec![b"a1".to_vec()]);
        assert_eq!(writer.stats().retried_rows, 1);
        assert_eq!(writer.stats().failed_rows, 1);
    }

    #[test]
    fn retry_budget_surfaces_last_status() {
        let transport = Arc::new(Scripted::default().on(
            b"a",
            vec![
                OperationStatus::NotRun,
                OperationStatus::failure("busy"),
                OperationStatus::NotRun,
                OperationStatus::Success,
            ],
        ));
        let writer = SyncWriter::new(transport.clone(), Arc::new(FirstByte), config());

        let statuses = writer.submit(&txn(), rows(&[b"a"])).unwrap().wait().unwrap();
        assert_eq!(statuses, vec![OperationStatus::NotRun]);
        assert_eq!(transport.calls.lock().len(), 3);
    }

    #[test]
    fn locate_failure_is_a_row_failure() {
        let writer = SyncWriter::new(
            Arc::new(Scripted::default()),
            Arc::new(FirstByte),
            config().max_retries(0),
        );
        let statuses = writer
            .submit(&txn(), rows(&[b"", b"a"]))
            .unwrap()
            .wait()
            .unwrap();
        assert!(matches!(statuses[0], OperationStatus::Failure(_)));
        assert_eq!(statuses[1], OperationStatus::Success);
    }

    #[test]
    fn async_writer_matches_sync_contract() {
        let transport = Arc::new(Scripted::default().on(b"b", vec![OperationStatus::NotRun]));
        let pool = Arc::new(WorkerPool::new("test-flush", 2));
        let writer = AsyncWriter::new(transport, Arc::new(FirstByte), config(), Arc::clone(&pool));

        let mut handle = writer.submit(&txn(), rows(&[b"a", b"b"])).unwrap();
        pool.wait_idle();
        assert!(handle.is_done());
        assert_eq!(
            handle.wait().unwrap(),
            vec![OperationStatus::Success, OperationStatus::Success]
        );
        assert_eq!(writer.stats().flushes, 1);

        pool.shutdown();
        assert!(matches!(
            writer.submit(&txn(), rows(&[b"a"])),
            Err(PipelineError::Shutdown)
        ));
    }
}
