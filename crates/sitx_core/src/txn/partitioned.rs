//! Transaction store split across partitions.

use crate::config::TxnConfig;
use crate::error::{CoreError, CoreResult};
use crate::stats::TxnStatsSnapshot;
use crate::txn::store::TxnStore;
use crate::txn::view::TxnView;
use crate::txn::TransactionStore;
use crate::types::{Timestamp, TxnId};

/// Routes each transaction id to one of N [`TxnStore`] partitions by
/// `id mod N`. Each record has exactly one owning partition, so per-id
/// compare-and-set semantics carry over unchanged.
pub struct PartitionedTxnStore {
    partitions: Vec<TxnStore>,
}

impl PartitionedTxnStore {
    /// Wraps existing partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if `partitions` is empty.
    pub fn new(partitions: Vec<TxnStore>) -> CoreResult<Self> {
        if partitions.is_empty() {
            return Err(CoreError::invalid_operation(
                "a partitioned store needs at least one partition",
            ));
        }
        Ok(Self { partitions })
    }

    /// Creates `config.partitions` in-memory partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured partition count is zero.
    pub fn in_memory(config: &TxnConfig) -> CoreResult<Self> {
        Self::new(
            (0..config.partitions)
                .map(|_| TxnStore::in_memory(config.clone()))
                .collect(),
        )
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Returns the partition owning `txn_id`.
    #[must_use]
    pub fn partition_for(&self, txn_id: TxnId) -> &TxnStore {
        let index = (txn_id.as_u64() % self.partitions.len() as u64) as usize;
        &self.partitions[index]
    }

    /// Sums the counters of every partition.
    #[must_use]
    pub fn stats(&self) -> TxnStatsSnapshot {
        let mut total = TxnStatsSnapshot::default();
        for partition in &self.partitions {
            total.accumulate(&partition.stats());
        }
        total
    }
}

impl TransactionStore for PartitionedTxnStore {
    fn record_transaction(&self, txn: &TxnView) -> CoreResult<()> {
        self.partition_for(txn.txn_id).record_transaction(txn)
    }

    fn record_commit(&self, txn_id: TxnId, commit_timestamp: Timestamp) -> CoreResult<()> {
        self.partition_for(txn_id)
            .record_commit(txn_id, commit_timestamp)
    }

    fn record_rollback(&self, txn_id: TxnId) -> CoreResult<()> {
        self.partition_for(txn_id).record_rollback(txn_id)
    }

    fn record_global_commit_timestamp(
        &self,
        txn_id: TxnId,
        global_commit_timestamp: Timestamp,
    ) -> CoreResult<()> {
        self.partition_for(txn_id)
            .record_global_commit_timestamp(txn_id, global_commit_timestamp)
    }

    fn record_keep_alive(&self, txn_id: TxnId) -> CoreResult<bool> {
        self.partition_for(txn_id).record_keep_alive(txn_id)
    }

    fn get_transaction(&self, txn_id: TxnId) -> CoreResult<TxnView> {
        self.partition_for(txn_id).get_transaction(txn_id)
    }

    fn get_active_txn_ids(
        &self,
        min_begin: Timestamp,
        max_begin: Timestamp,
        table: Option<&str>,
    ) -> CoreResult<Vec<TxnId>> {
        let mut entries: Vec<(Timestamp, TxnId)> = self
            .partitions
            .iter()
            .flat_map(|p| p.active_entries(min_begin, max_begin, table))
            .collect();
        entries.sort_unstable();
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    fn is_timed_out(&self, txn_id: TxnId) -> CoreResult<bool> {
        self.partition_for(txn_id).is_timed_out(txn_id)
    }
}
