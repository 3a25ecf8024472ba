//! Transaction records: views, the durable log, and the stores that own them.

mod chain;
mod log;
mod partitioned;
mod store;
mod view;

pub(crate) use chain::MAX_CHAIN_DEPTH;
pub use chain::{TxnChain, WriterFate};
pub use log::{compute_crc32, TxnLog, TxnLogRecord, TxnLogRecordType, LOG_MAGIC, LOG_VERSION};
pub use partitioned::PartitionedTxnStore;
pub use store::TxnStore;
pub use view::TxnView;

use crate::error::CoreResult;
use crate::types::{Timestamp, TxnId, TxnState};

/// Durable record of transaction lifecycle state.
///
/// State moves `Active -> Committed` or `Active -> RolledBack` and never
/// leaves a terminal state. Every transition is a compare-and-set on the
/// owning partition, so of two racing terminal transitions exactly one wins.
pub trait TransactionStore: Send + Sync {
    /// Records a new transaction.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken; `InvalidOperation` if the view is
    /// not a fresh active transaction.
    fn record_transaction(&self, txn: &TxnView) -> CoreResult<()>;

    /// Moves an active transaction to `Committed` at `commit_timestamp`.
    ///
    /// Repeating a commit with the same timestamp succeeds without effect.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if the transaction rolled back or committed
    /// at a different timestamp; `NotFound` for an unknown id.
    fn record_commit(&self, txn_id: TxnId, commit_timestamp: Timestamp) -> CoreResult<()>;

    /// Moves an active transaction to `RolledBack`.
    ///
    /// Repeating a rollback succeeds without effect.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if the transaction committed; `NotFound`
    /// for an unknown id.
    fn record_rollback(&self, txn_id: TxnId) -> CoreResult<()>;

    /// Caches the root commit timestamp of a committed nested transaction.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` unless the transaction is committed;
    /// `ConflictingTimestamp` if a different value is already cached.
    fn record_global_commit_timestamp(
        &self,
        txn_id: TxnId,
        global_commit_timestamp: Timestamp,
    ) -> CoreResult<()>;

    /// Refreshes the keep-alive of an active transaction. Returns `false`
    /// if the transaction is already terminal.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    fn record_keep_alive(&self, txn_id: TxnId) -> CoreResult<bool>;

    /// Returns the current snapshot of a transaction.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    fn get_transaction(&self, txn_id: TxnId) -> CoreResult<TxnView>;

    /// Returns the current state of a transaction.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    fn get_state(&self, txn_id: TxnId) -> CoreResult<TxnState> {
        Ok(self.get_transaction(txn_id)?.state)
    }

    /// Returns the commit timestamp, or `None` if not committed.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    fn get_commit_timestamp(&self, txn_id: TxnId) -> CoreResult<Option<Timestamp>> {
        Ok(self.get_transaction(txn_id)?.commit_timestamp)
    }

    /// Ids of transactions active right now with begin timestamp in
    /// `[min_begin, max_begin)`, optionally only those writing to `table`.
    /// Ordered by `(begin timestamp, id)`.
    ///
    /// # Errors
    ///
    /// Implementations backed by remote partitions may fail.
    fn get_active_txn_ids(
        &self,
        min_begin: Timestamp,
        max_begin: Timestamp,
        table: Option<&str>,
    ) -> CoreResult<Vec<TxnId>>;

    /// Returns true if the transaction is active and its last keep-alive is
    /// older than the configured timeout.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    fn is_timed_out(&self, txn_id: TxnId) -> CoreResult<bool>;
}
