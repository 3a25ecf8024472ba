//! Client-side call buffer.

use crate::config::{BackpressurePolicy, BufferConfiguration};
use crate::error::{PipelineError, PipelineResult};
use crate::monitor::{Monitor, RejectionEvent};
use crate::writer::{FlushHandle, Writer};
use sitx_core::{get_correct_status, OperationStatus, TxnView};
use sitx_storage::KvPair;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A buffered row tagged with its submission sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRow {
    /// Position of the row among all rows submitted to the buffer.
    pub seq: u64,
    /// The mutation.
    pub pair: KvPair,
}

/// The final status of one submitted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowStatus {
    /// Submission sequence number.
    pub seq: u64,
    /// Outcome of the row.
    pub status: OperationStatus,
}

/// Rewrites a batch right before it is sent.
///
/// A hook may drop rows, add rows, or fan one row out into several, as long
/// as every produced row keeps the `seq` of the row it came from. Statuses
/// of rows sharing a `seq` are merged with [`get_correct_status`]; a `seq`
/// with no produced rows reports success.
pub trait PreFlushHook: Send + Sync {
    /// Transforms `rows`.
    ///
    /// # Errors
    ///
    /// An error aborts the flush and leaves the rows buffered.
    fn pre_flush(&self, rows: Vec<PendingRow>) -> PipelineResult<Vec<PendingRow>>;
}

impl<F> PreFlushHook for F
where
    F: Fn(Vec<PendingRow>) -> PipelineResult<Vec<PendingRow>> + Send + Sync,
{
    fn pre_flush(&self, rows: Vec<PendingRow>) -> PipelineResult<Vec<PendingRow>> {
        self(rows)
    }
}

struct InFlight {
    submitted: Vec<u64>,
    sent: Vec<u64>,
    handle: FlushHandle,
}

/// Accumulates mutations for one (partition, transaction) pair.
///
/// The buffer flushes once `max_entries` rows or `max_heap_size` bytes are
/// pending. At most `max_flushes_per_region` flushes are in flight; past
/// that the monitor's rejection hooks fire and the backpressure policy
/// decides whether to wait or to fail with `Rejected`.
///
/// Every submitted row ends up with exactly one [`RowStatus`], collected with
/// [`take_completed`](Self::take_completed) or returned by
/// [`close`](Self::close). A buffer must be closed; dropping an open buffer
/// closes it and logs an error.
pub struct CallBuffer {
    partition: String,
    txn: TxnView,
    config: BufferConfiguration,
    policy: BackpressurePolicy,
    writer: Arc<dyn Writer>,
    hook: Option<Arc<dyn PreFlushHook>>,
    monitor: Arc<Monitor>,
    pending: Vec<PendingRow>,
    heap_size: usize,
    next_seq: u64,
    in_flight: VecDeque<InFlight>,
    completed: BTreeMap<u64, OperationStatus>,
    closed: bool,
}

impl CallBuffer {
    /// Opens a buffer and counts it as outstanding on `monitor`.
    pub fn new(
        partition: impl Into<String>,
        txn: TxnView,
        config: BufferConfiguration,
        writer: Arc<dyn Writer>,
        monitor: Arc<Monitor>,
    ) -> Self {
        monitor.buffer_opened();
        Self {
            partition: partition.into(),
            txn,
            config: config.normalized(),
            policy: BackpressurePolicy::default(),
            writer,
            hook: None,
            monitor,
            pending: Vec::new(),
            heap_size: 0,
            next_seq: 0,
            in_flight: VecDeque::new(),
            completed: BTreeMap::new(),
            closed: false,
        }
    }

    /// Installs a pre-flush hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn PreFlushHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Sets the backpressure policy.
    #[must_use]
    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Destination of the buffer.
    #[must_use]
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Transaction the rows are written under.
    #[must_use]
    pub fn txn(&self) -> &TxnView {
        &self.txn
    }

    /// Flush thresholds.
    #[must_use]
    pub fn config(&self) -> BufferConfiguration {
        self.config
    }

    /// Rows waiting for the next flush.
    #[must_use]
    pub fn pending_entries(&self) -> usize {
        self.pending.len()
    }

    /// Encoded size of the pending rows.
    #[must_use]
    pub fn pending_heap_size(&self) -> usize {
        self.heap_size
    }

    /// Flushes submitted and not yet collected.
    #[must_use]
    pub fn in_flight_flushes(&self) -> usize {
        self.in_flight.len()
    }

    /// Rows submitted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.next_seq
    }

    /// Returns true after [`close`](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffers `pair`, flushing if a threshold is reached. Returns the row's
    /// sequence number.
    ///
    /// # Errors
    ///
    /// `Closed` after close. Flush errors are returned with the row already
    /// buffered.
    pub fn add(&mut self, pair: KvPair) -> PipelineResult<u64> {
        if self.closed {
            return Err(PipelineError::Closed {
                partition: self.partition.clone(),
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap_size += pair.heap_size();
        self.pending.push(PendingRow { seq, pair });

        if self.pending.len() >= self.config.max_entries || self.heap_size >= self.config.max_heap_size {
            self.flush()?;
        }
        Ok(seq)
    }

    /// Buffers every pair of `pairs`.
    ///
    /// # Errors
    ///
    /// Stops at the first error of [`add`](Self::add).
    pub fn add_all<I>(&mut self, pairs: I) -> PipelineResult<()>
    where
        I: IntoIterator<Item = KvPair>,
    {
        for pair in pairs {
            self.add(pair)?;
        }
        Ok(())
    }

    /// Sends the pending rows now.
    ///
    /// # Errors
    ///
    /// `Rejected` at the in-flight limit under the `Reject` policy, or the
    /// hook's or writer's error. The pending rows stay buffered on error.
    pub fn flush(&mut self) -> PipelineResult<()> {
        if self.closed {
            return Err(PipelineError::Closed {
                partition: self.partition.clone(),
            });
        }
        self.send_pending(self.policy)
    }

    /// Statuses of every row whose flush has finished since the last call,
    /// ordered by sequence number. Never blocks.
    pub fn take_completed(&mut self) -> Vec<RowStatus> {
        self.reap();
        self.drain_completed()
    }

    /// Flushes what is pending, waits for every flush and returns the
    /// remaining statuses. A second call returns nothing.
    ///
    /// Rows that cannot be sent get a failure status, so the returned
    /// statuses plus those already taken cover every submitted row.
    pub fn close(&mut self) -> Vec<RowStatus> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        if let Err(err) = self.send_pending(BackpressurePolicy::Block) {
            warn!(partition = %self.partition, error = %err, rows = self.pending.len(), "rows failed at close");
            let status = OperationStatus::failure(err.to_string());
            for row in std::mem::take(&mut self.pending) {
                self.completed.insert(row.seq, status.clone());
            }
            self.heap_size = 0;
        }
        while !self.in_flight.is_empty() {
            self.complete_oldest();
        }
        self.monitor.buffer_closed();
        debug!(partition = %self.partition, txn = %self.txn.txn_id, rows = self.next_seq, "closed call buffer");
        self.drain_completed()
    }

    fn send_pending(&mut self, policy: BackpressurePolicy) -> PipelineResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.reap();
        while self.in_flight.len() >= self.config.max_flushes_per_region {
            self.monitor.reject(&RejectionEvent {
                partition: self.partition.clone(),
                in_flight: self.in_flight.len(),
                limit: self.config.max_flushes_per_region,
                pending_entries: self.pending.len(),
            });
            match policy {
                BackpressurePolicy::Block => self.complete_oldest(),
                BackpressurePolicy::Reject => {
                    return Err(PipelineError::Rejected {
                        partition: self.partition.clone(),
                        in_flight: self.in_flight.len(),
                        limit: self.config.max_flushes_per_region,
                    });
                }
            }
        }

        let submitted: Vec<u64> = self.pending.iter().map(|row| row.seq).collect();
        let rows = match &self.hook {
            Some(hook) => hook.pre_flush(self.pending.clone())?,
            None => self.pending.clone(),
        };
        let sent: Vec<u64> = rows.iter().map(|row| row.seq).collect();
        let pairs: Vec<KvPair> = rows.into_iter().map(|row| row.pair).collect();
        let handle = self.writer.submit(&self.txn, pairs)?;

        debug!(
            partition = %self.partition,
            txn = %self.txn.txn_id,
            rows = submitted.len(),
            sent = sent.len(),
            "flushed call buffer"
        );
        self.pending.clear();
        self.heap_size = 0;
        self.in_flight.push_back(InFlight {
            submitted,
            sent,
            handle,
        });
        Ok(())
    }

    fn reap(&mut self) {
        while self
            .in_flight
            .front_mut()
            .is_some_and(|flush| flush.handle.is_done())
        {
            self.complete_oldest();
        }
    }

    fn complete_oldest(&mut self) {
        let Some(flush) = self.in_flight.pop_front() else {
            return;
        };
        let statuses = match flush.handle.wait() {
            Ok(statuses) if statuses.len() == flush.sent.len() => statuses,
            Ok(statuses) => {
                warn!(
                    partition = %self.partition,
                    statuses = statuses.len(),
                    rows = flush.sent.len(),
                    "writer returned the wrong number of statuses"
                );
                let message = format!(
                    "writer returned {} statuses for {} rows",
                    statuses.len(),
                    flush.sent.len()
                );
                vec![OperationStatus::failure(message); flush.sent.len()]
            }
            Err(err) => {
                warn!(partition = %self.partition, error = %err, "flush lost");
                vec![OperationStatus::failure(err.to_string()); flush.sent.len()]
            }
        };

        let mut merged: BTreeMap<u64, OperationStatus> = flush
            .submitted
            .iter()
            .map(|&seq| (seq, OperationStatus::Success))
            .collect();
        for (seq, status) in flush.sent.into_iter().zip(statuses) {
            match merged.get_mut(&seq) {
                Some(old) => *old = get_correct_status(status, old.clone()),
                None => warn!(partition = %self.partition, seq, "hook produced a row for an unknown sequence"),
            }
        }
        self.completed.extend(merged);
    }

    fn drain_completed(&mut self) -> Vec<RowStatus> {
        std::mem::take(&mut self.completed)
            .into_iter()
            .map(|(seq, status)| RowStatus { seq, status })
            .collect()
    }
}

impl Drop for CallBuffer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        error!(
            partition = %self.partition,
            txn = %self.txn.txn_id,
            pending = self.pending.len(),
            in_flight = self.in_flight.len(),
            "call buffer dropped without close"
        );
        let failed = self
            .close()
            .iter()
            .filter(|row| !row.status.is_success())
            .count();
        if failed > 0 {
            warn!(partition = %self.partition, failed, "unclaimed row failures in dropped call buffer");
        }
    }
}
