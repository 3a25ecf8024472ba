//! Lazy cleanup of cells discovered stale during reads.

use crate::error::CoreResult;
use crate::types::{Timestamp, TxnId};
use bytes::Bytes;
use parking_lot::Mutex;
use sitx_storage::VersionedStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Receives cells the visibility filter found stale.
///
/// Called from the read path, so implementations must not block on cleanup.
pub trait ReadResolver: Send + Sync {
    /// The cell of `txn_id` on `row_key` belongs to a rolled-back writer.
    fn resolve_rolled_back(&self, row_key: &Bytes, txn_id: TxnId);

    /// The cell of `txn_id` on `row_key` is committed at `commit_timestamp`
    /// but does not carry that timestamp yet.
    fn resolve_committed(&self, row_key: &Bytes, txn_id: TxnId, commit_timestamp: Timestamp);
}

/// Discards every hand-off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReadResolver;

impl ReadResolver for NoopReadResolver {
    fn resolve_rolled_back(&self, _row_key: &Bytes, _txn_id: TxnId) {}

    fn resolve_committed(&self, _row_key: &Bytes, _txn_id: TxnId, _commit_timestamp: Timestamp) {}
}

/// Applies cleanup to the cell store on the calling thread.
#[derive(Debug, Clone)]
pub struct SynchronousReadResolver {
    cells: Arc<VersionedStore>,
}

impl SynchronousReadResolver {
    /// Creates a resolver writing to `cells`.
    #[must_use]
    pub fn new(cells: Arc<VersionedStore>) -> Self {
        Self { cells }
    }
}

impl ReadResolver for SynchronousReadResolver {
    fn resolve_rolled_back(&self, row_key: &Bytes, txn_id: TxnId) {
        apply(&self.cells, &Task::Delete(row_key.clone(), txn_id));
    }

    fn resolve_committed(&self, row_key: &Bytes, txn_id: TxnId, commit_timestamp: Timestamp) {
        apply(
            &self.cells,
            &Task::CacheCommit(row_key.clone(), txn_id, commit_timestamp),
        );
    }
}

enum Task {
    Delete(Bytes, TxnId),
    CacheCommit(Bytes, TxnId, Timestamp),
}

fn apply(cells: &VersionedStore, task: &Task) -> bool {
    match task {
        Task::Delete(row_key, txn_id) => cells.remove_version(row_key, txn_id.as_u64()),
        Task::CacheCommit(row_key, txn_id, ts) => {
            cells.set_commit_timestamp(row_key, txn_id.as_u64(), ts.as_u64())
        }
    }
}

/// Queues cleanup to a background thread.
///
/// Hand-offs after [`shutdown`](Self::shutdown) are dropped; they only ever
/// delay an optimization.
pub struct AsyncReadResolver {
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    applied: Arc<AtomicU64>,
}

impl AsyncReadResolver {
    /// Starts the background worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn start(cells: Arc<VersionedStore>) -> CoreResult<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let applied = Arc::new(AtomicU64::new(0));
        let worker_applied = Arc::clone(&applied);
        let worker = thread::Builder::new()
            .name("sitx-read-resolver".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if apply(&cells, &task) {
                        worker_applied.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            applied,
        })
    }

    /// Number of hand-offs that changed a cell.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Finishes queued work and joins the worker. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("read resolver worker panicked");
            }
        }
        info!(applied = self.applied(), "read resolver shut down");
    }

    fn enqueue(&self, task: Task) {
        let sent = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(task).is_ok());
        if !sent {
            debug!("read resolver shut down, hand-off dropped");
        }
    }
}

impl ReadResolver for AsyncReadResolver {
    fn resolve_rolled_back(&self, row_key: &Bytes, txn_id: TxnId) {
        self.enqueue(Task::Delete(row_key.clone(), txn_id));
    }

    fn resolve_committed(&self, row_key: &Bytes, txn_id: TxnId, commit_timestamp: Timestamp) {
        self.enqueue(Task::CacheCommit(row_key.clone(), txn_id, commit_timestamp));
    }
}

impl Drop for AsyncReadResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
