//! Partition-side batch applier.

use crate::filter::{NoopReadResolver, ReadResolver, TxnFilter};
use crate::resolver::TxnResolver;
use crate::status::OperationStatus;
use crate::txn::{TransactionStore, TxnView, WriterFate};
use crate::types::TxnId;
use bytes::Bytes;
use parking_lot::Mutex;
use sitx_storage::{Cell, KvPair, MutationKind, ReadOptions, VersionedStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Validates and writes batches of mutations into one partition.
///
/// Each row is handled on its own and gets its own status:
///
/// 1. a key outside `[start, end)` is `NotRun`, so the writer relocates it;
/// 2. a row whose lock is held by a concurrent batch is `NotRun`;
/// 3. a row holding a version the writer may not overwrite is a conflict;
/// 4. otherwise the version is written at the writer's begin timestamp.
///
/// A batch from a transaction that is not active fails every row with a
/// sanity-check failure.
pub struct TxnRegion {
    name: String,
    start_key: Bytes,
    end_key: Option<Bytes>,
    cells: Arc<VersionedStore>,
    txns: Arc<dyn TransactionStore>,
    resolver: Option<Arc<TxnResolver>>,
    row_locks: Mutex<HashSet<Bytes>>,
}

struct RowLock<'a> {
    locks: &'a Mutex<HashSet<Bytes>>,
    key: Bytes,
}

impl Drop for RowLock<'_> {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}

impl TxnRegion {
    /// Creates a region over `[start_key, end_key)`; `None` is unbounded.
    pub fn new(
        name: impl Into<String>,
        start_key: Bytes,
        end_key: Option<Bytes>,
        cells: Arc<VersionedStore>,
        txns: Arc<dyn TransactionStore>,
    ) -> Self {
        Self {
            name: name.into(),
            start_key,
            end_key,
            cells,
            txns,
            resolver: None,
            row_locks: Mutex::new(HashSet::new()),
        }
    }

    /// Hands timed-out and unresolved writers met during conflict checks to
    /// `resolver`.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<TxnResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Region name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cells held by this region.
    #[must_use]
    pub fn cells(&self) -> &Arc<VersionedStore> {
        &self.cells
    }

    /// Returns true if `row_key` falls in this region.
    #[must_use]
    pub fn contains(&self, row_key: &[u8]) -> bool {
        row_key >= self.start_key.as_ref()
            && self.end_key.as_ref().map_or(true, |end| row_key < end.as_ref())
    }

    /// Takes the lock of `row_key` if it is free.
    fn try_lock_row(&self, row_key: &Bytes) -> Option<RowLock<'_>> {
        self.row_locks
            .lock()
            .insert(row_key.clone())
            .then(|| RowLock {
                locks: &self.row_locks,
                key: row_key.clone(),
            })
    }

    /// Applies `mutations` on behalf of `txn`, one status per mutation in
    /// input order.
    pub fn apply_batch(&self, txn: &TxnView, mutations: &[KvPair]) -> Vec<OperationStatus> {
        match self.txns.get_state(txn.txn_id) {
            Ok(state) if !state.is_terminal() => {}
            Ok(state) => {
                let message = format!("{} is {state}, writes need an active transaction", txn.txn_id);
                warn!(region = %self.name, txn = %txn.txn_id, %state, "write from finished transaction");
                return vec![OperationStatus::sanity_check_failure(message); mutations.len()];
            }
            Err(err) => {
                warn!(region = %self.name, txn = %txn.txn_id, error = %err, "write from unknown transaction");
                return vec![OperationStatus::sanity_check_failure(err.to_string()); mutations.len()];
            }
        }

        let read_resolver: Arc<dyn ReadResolver> = Arc::new(NoopReadResolver);
        let mut filter = match TxnFilter::new(
            txn.clone(),
            Arc::clone(&self.txns),
            self.resolver.clone(),
            read_resolver,
        ) {
            Ok(filter) => filter,
            Err(err) => {
                return vec![OperationStatus::failure(err.to_string()); mutations.len()];
            }
        };

        let statuses: Vec<OperationStatus> = mutations
            .iter()
            .map(|kv| self.apply_one(&mut filter, txn, kv))
            .collect();
        debug!(
            region = %self.name,
            txn = %txn.txn_id,
            rows = mutations.len(),
            failed = statuses.iter().filter(|s| !s.is_success()).count(),
            "applied batch"
        );
        statuses
    }

    fn apply_one(&self, filter: &mut TxnFilter, txn: &TxnView, kv: &KvPair) -> OperationStatus {
        let row_key = kv.row_key();
        if !self.contains(row_key) {
            return OperationStatus::NotRun;
        }
        let Some(_lock) = self.try_lock_row(row_key) else {
            return OperationStatus::NotRun;
        };

        let mut options = ReadOptions::default();
        options.return_all_versions();
        for cell in self.cells.get(row_key, &options) {
            let fate = match filter.fate(row_key, &cell) {
                Ok(fate) => fate,
                Err(err) => return OperationStatus::failure(err.to_string()),
            };
            if !fate.conflicts_with(txn) {
                continue;
            }
            return self.conflict_status(txn, kv, TxnId(cell.txn_id), fate);
        }

        let ts = txn.begin_timestamp.as_u64();
        let id = txn.txn_id.as_u64();
        let cell = match kv.kind() {
            MutationKind::Delete => Cell::tombstone(ts, id),
            _ => Cell::put(ts, id, kv.value().clone()),
        };
        self.cells.put(row_key.clone(), cell);
        OperationStatus::Success
    }

    fn conflict_status(
        &self,
        txn: &TxnView,
        kv: &KvPair,
        other: TxnId,
        fate: WriterFate,
    ) -> OperationStatus {
        let other_additive = match self.txns.get_transaction(other) {
            Ok(view) => view.additive,
            Err(err) => return OperationStatus::failure(err.to_string()),
        };
        if txn.additive && other_additive {
            if kv.kind().is_insert_like() {
                return self.write_additive(txn, kv);
            }
            return OperationStatus::additive_write_conflict();
        }
        debug!(region = %self.name, txn = %txn.txn_id, %other, ?fate, "write conflict");
        OperationStatus::write_conflict(format!(
            "{} conflicts with {other} on row {:?}",
            txn.txn_id,
            kv.row_key()
        ))
    }

    fn write_additive(&self, txn: &TxnView, kv: &KvPair) -> OperationStatus {
        self.cells.put(
            kv.row_key().clone(),
            Cell::put(
                txn.begin_timestamp.as_u64(),
                txn.txn_id.as_u64(),
                kv.value().clone(),
            ),
        );
        OperationStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxnConfig;
    use crate::status::FailureKind;
    use crate::txn::TxnStore;
    use crate::types::Timestamp;

    fn region(txns: &Arc<dyn TransactionStore>, start: &'static [u8], end: Option<&'static [u8]>) -> TxnRegion {
        TxnRegion::new(
            "r1",
            Bytes::from_static(start),
            end.map(Bytes::from_static),
            Arc::new(VersionedStore::new()),
            Arc::clone(txns),
        )
    }

    fn txns() -> Arc<dyn TransactionStore> {
        Arc::new(TxnStore::in_memory(TxnConfig::default()))
    }

    fn begin(txns: &Arc<dyn TransactionStore>, id: u64, additive: bool) -> TxnView {
        let view = TxnView::new(TxnId(id), Timestamp(id)).additive(additive);
        txns.record_transaction(&view).unwrap();
        view
    }

    fn failure_kind(status: &OperationStatus) -> Option<FailureKind> {
        match status {
            OperationStatus::Failure(f) => Some(f.kind()),
            _ => None,
        }
    }

    #[test]
    fn writes_cells_at_begin_timestamp() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let txn = begin(&txns, 5, false);

        let statuses = region.apply_batch(
            &txn,
            &[KvPair::insert(&b"a"[..], &b"1"[..]), KvPair::delete(&b"b"[..])],
        );
        assert!(statuses.iter().all(OperationStatus::is_success));

        let cells = region.cells().get(b"a", &ReadOptions::default());
        assert_eq!(cells[0].timestamp, 5);
        assert_eq!(cells[0].txn_id, 5);
        assert!(region.cells().get(b"b", &ReadOptions::default())[0].is_tombstone());
    }

    #[test]
    fn out_of_range_rows_are_not_run() {
        let txns = txns();
        let region = region(&txns, b"m", Some(b"t"));
        let txn = begin(&txns, 1, false);

        let statuses = region.apply_batch(
            &txn,
            &[
                KvPair::upsert(&b"a"[..], &b""[..]),
                KvPair::upsert(&b"m"[..], &b""[..]),
                KvPair::upsert(&b"t"[..], &b""[..]),
            ],
        );
        assert_eq!(
            statuses,
            vec![
                OperationStatus::NotRun,
                OperationStatus::Success,
                OperationStatus::NotRun
            ]
        );
    }

    #[test]
    fn locked_row_is_not_run() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let txn = begin(&txns, 1, false);
        let key = Bytes::from_static(b"k");

        let held = region.try_lock_row(&key).unwrap();
        let statuses = region.apply_batch(&txn, &[KvPair::upsert(key.clone(), &b"v"[..])]);
        assert_eq!(statuses, vec![OperationStatus::NotRun]);

        drop(held);
        let statuses = region.apply_batch(&txn, &[KvPair::upsert(key, &b"v"[..])]);
        assert_eq!(statuses, vec![OperationStatus::Success]);
    }

    #[test]
    fn concurrent_writers_conflict() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let first = begin(&txns, 1, false);
        let second = begin(&txns, 2, false);

        let ok = region.apply_batch(&first, &[KvPair::upsert(&b"k"[..], &b"1"[..])]);
        assert_eq!(ok, vec![OperationStatus::Success]);

        let statuses = region.apply_batch(
            &second,
            &[
                KvPair::upsert(&b"k"[..], &b"2"[..]),
                KvPair::upsert(&b"other"[..], &b"2"[..]),
            ],
        );
        assert_eq!(failure_kind(&statuses[0]), Some(FailureKind::WriteConflict));
        assert!(!statuses[0].is_retryable());
        assert_eq!(statuses[1], OperationStatus::Success);
    }

    #[test]
    fn committed_before_begin_is_not_a_conflict() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let first = begin(&txns, 1, false);
        region.apply_batch(&first, &[KvPair::upsert(&b"k"[..], &b"1"[..])]);
        txns.record_commit(TxnId(1), Timestamp(2)).unwrap();

        let later = begin(&txns, 3, false);
        assert_eq!(
            region.apply_batch(&later, &[KvPair::update(&b"k"[..], &b"3"[..])]),
            vec![OperationStatus::Success]
        );
    }

    #[test]
    fn committed_after_begin_conflicts_and_rolled_back_does_not() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let early = begin(&txns, 1, false);
        let writer = begin(&txns, 2, false);
        region.apply_batch(&writer, &[KvPair::upsert(&b"k"[..], &b"w"[..])]);
        txns.record_commit(TxnId(2), Timestamp(3)).unwrap();

        let statuses = region.apply_batch(&early, &[KvPair::upsert(&b"k"[..], &b"e"[..])]);
        assert_eq!(failure_kind(&statuses[0]), Some(FailureKind::WriteConflict));

        let aborted = begin(&txns, 4, false);
        region.apply_batch(&aborted, &[KvPair::upsert(&b"j"[..], &b"a"[..])]);
        txns.record_rollback(TxnId(4)).unwrap();
        let next = begin(&txns, 5, false);
        assert_eq!(
            region.apply_batch(&next, &[KvPair::upsert(&b"j"[..], &b"n"[..])]),
            vec![OperationStatus::Success]
        );
    }

    #[test]
    fn additive_transactions() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let a = begin(&txns, 1, true);
        let b = begin(&txns, 2, true);

        region.apply_batch(&a, &[KvPair::insert(&b"k"[..], &b"a"[..])]);
        assert_eq!(
            region.apply_batch(&b, &[KvPair::insert(&b"k"[..], &b"b"[..])]),
            vec![OperationStatus::Success]
        );

        let statuses = region.apply_batch(&b, &[KvPair::update(&b"k"[..], &b"b2"[..])]);
        assert_eq!(statuses, vec![OperationStatus::additive_write_conflict()]);

        let plain = begin(&txns, 3, false);
        let statuses = region.apply_batch(&plain, &[KvPair::insert(&b"k"[..], &b"c"[..])]);
        assert_eq!(failure_kind(&statuses[0]), Some(FailureKind::WriteConflict));
    }

    #[test]
    fn finished_transaction_fails_sanity_check() {
        let txns = txns();
        let region = region(&txns, b"", None);
        let txn = begin(&txns, 1, false);
        txns.record_rollback(TxnId(1)).unwrap();

        let statuses = region.apply_batch(
            &txn,
            &[KvPair::upsert(&b"a"[..], &b""[..]), KvPair::upsert(&b"b"[..], &b""[..])],
        );
        assert_eq!(statuses.len(), 2);
        assert!(statuses
            .iter()
            .all(|s| matches!(s, OperationStatus::SanityCheckFailure(_))));

        let unknown = TxnView::new(TxnId(9), Timestamp(9));
        let statuses = region.apply_batch(&unknown, &[KvPair::upsert(&b"a"[..], &b""[..])]);
        assert!(matches!(statuses[0], OperationStatus::SanityCheckFailure(_)));
    }
}
