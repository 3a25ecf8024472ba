//! Test fixtures: transaction harness, in-memory cluster and fault injection.
//!
//! Fixtures panic on setup failures, like any test helper.

use bytes::Bytes;
use parking_lot::Mutex;
use sitx_core::{
    MonotonicTimestampSource, NoopReadResolver, OperationStatus, PartitionedTxnStore,
    ReadController, ReadResolver, Timestamp, TimestampSource, TransactionStore, TxnConfig, TxnId,
    TxnRegion, TxnResolver, TxnStore, TxnView,
};
use sitx_pipeline::{BulkWriter, PartitionLocator, PipelineError, PipelineResult};
use sitx_storage::{FileBackend, KvPair, VersionedStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Begins, commits and rolls back transactions against one store.
///
/// Transaction ids and timestamps come from the same monotonic counter, so a
/// transaction's id equals its begin timestamp.
pub struct TxnHarness {
    txns: Arc<dyn TransactionStore>,
    timestamps: MonotonicTimestampSource,
    path: Option<PathBuf>,
    _temp_dir: Option<TempDir>,
}

impl TxnHarness {
    /// Harness over a partitioned in-memory store.
    pub fn memory() -> Self {
        let store = PartitionedTxnStore::in_memory(&TxnConfig::default().partitions(4))
            .expect("Failed to create partitioned store");
        Self {
            txns: Arc::new(store),
            timestamps: MonotonicTimestampSource::default(),
            path: None,
            _temp_dir: None,
        }
    }

    /// Harness over a store whose log lives in a temporary file.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("txn.log");
        let store = open_file_store(&path);
        Self {
            txns: Arc::new(store),
            timestamps: MonotonicTimestampSource::default(),
            path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Opens the log file again as a fresh store, replaying it.
    ///
    /// Timestamps continue after the last one issued.
    pub fn reopen(self) -> Self {
        let path = self.path.clone().expect("Only file harnesses can be reopened");
        let last = self.timestamps.current().as_u64();
        drop(self.txns);
        Self {
            txns: Arc::new(open_file_store(&path)),
            timestamps: MonotonicTimestampSource::starting_after(last),
            path: Some(path),
            _temp_dir: self._temp_dir,
        }
    }

    /// The transaction store.
    pub fn txns(&self) -> &Arc<dyn TransactionStore> {
        &self.txns
    }

    /// Issues the next timestamp.
    pub fn next_timestamp(&self) -> Timestamp {
        self.timestamps.next_timestamp()
    }

    /// Records and returns `view`.
    pub fn record(&self, view: TxnView) -> TxnView {
        self.txns
            .record_transaction(&view)
            .expect("Failed to record transaction");
        view
    }

    /// Begins a top-level transaction.
    pub fn begin(&self) -> TxnView {
        let ts = self.next_timestamp();
        self.record(TxnView::new(TxnId(ts.as_u64()), ts))
    }

    /// Begins an additive top-level transaction.
    pub fn begin_additive(&self) -> TxnView {
        let ts = self.next_timestamp();
        self.record(TxnView::new(TxnId(ts.as_u64()), ts).additive(true))
    }

    /// Begins a child of `parent`.
    pub fn begin_child(&self, parent: &TxnView) -> TxnView {
        let ts = self.next_timestamp();
        self.record(
            TxnView::new(TxnId(ts.as_u64()), ts)
                .with_parent(parent.txn_id)
                .with_isolation(parent.isolation)
                .additive(parent.additive),
        )
    }

    /// Commits `txn` at the next timestamp and returns it.
    pub fn commit(&self, txn: &TxnView) -> Timestamp {
        let ts = self.next_timestamp();
        self.txns
            .record_commit(txn.txn_id, ts)
            .expect("Failed to commit transaction");
        ts
    }

    /// Rolls back `txn`.
    pub fn rollback(&self, txn: &TxnView) {
        self.txns
            .record_rollback(txn.txn_id)
            .expect("Failed to roll back transaction");
    }

    /// Begins a transaction that reads everything committed so far.
    pub fn reader(&self) -> TxnView {
        self.begin()
    }
}

fn open_file_store(path: &std::path::Path) -> TxnStore {
    let backend = FileBackend::open_with_create_dirs(path).expect("Failed to create log backend");
    TxnStore::open(Box::new(backend), TxnConfig::default()).expect("Failed to open transaction store")
}

/// Regions over contiguous key ranges, wired as the pipeline's transport
/// and partition locator.
///
/// Split points divide the key space: `Cluster::new(&[b"m"])` creates
/// `region-0` over `[.., "m")` and `region-1` over `["m", ..)`.
pub struct Cluster {
    harness: TxnHarness,
    regions: Vec<Arc<TxnRegion>>,
    by_name: HashMap<String, usize>,
    resolver: Option<Arc<TxnResolver>>,
    read_resolver: Arc<dyn ReadResolver>,
}

impl Cluster {
    /// Creates regions at `split_points` over an in-memory harness.
    pub fn new(split_points: &[&[u8]]) -> Self {
        Self::with_harness(TxnHarness::memory(), split_points, None)
    }

    /// Creates regions with a transaction resolver attached to both the
    /// write and the read path.
    pub fn with_resolver(split_points: &[&[u8]]) -> Self {
        let resolver = Arc::new(TxnResolver::start().expect("Failed to start resolver"));
        Self::with_harness(TxnHarness::memory(), split_points, Some(resolver))
    }

    /// Creates regions over `harness`.
    pub fn with_harness(
        harness: TxnHarness,
        split_points: &[&[u8]],
        resolver: Option<Arc<TxnResolver>>,
    ) -> Self {
        let mut bounds: Vec<Bytes> = vec![Bytes::new()];
        bounds.extend(split_points.iter().map(|p| Bytes::copy_from_slice(p)));

        let mut regions = Vec::with_capacity(bounds.len());
        let mut by_name = HashMap::new();
        for (i, start) in bounds.iter().enumerate() {
            let name = format!("region-{i}");
            let mut region = TxnRegion::new(
                name.clone(),
                start.clone(),
                bounds.get(i + 1).cloned(),
                Arc::new(VersionedStore::new()),
                Arc::clone(harness.txns()),
            );
            if let Some(resolver) = &resolver {
                region = region.with_resolver(Arc::clone(resolver));
            }
            by_name.insert(name, i);
            regions.push(Arc::new(region));
        }

        Self {
            harness,
            regions,
            by_name,
            resolver,
            read_resolver: Arc::new(NoopReadResolver),
        }
    }

    /// Replaces the read resolver used by [`get`](Self::get) and
    /// [`scan`](Self::scan).
    pub fn set_read_resolver(&mut self, read_resolver: Arc<dyn ReadResolver>) {
        self.read_resolver = read_resolver;
    }

    /// The transaction harness.
    pub fn harness(&self) -> &TxnHarness {
        &self.harness
    }

    /// The resolver, if any.
    pub fn resolver(&self) -> Option<&Arc<TxnResolver>> {
        self.resolver.as_ref()
    }

    /// Region names in key order.
    pub fn region_names(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.name()).collect()
    }

    /// The region holding `row_key`.
    pub fn region_for(&self, row_key: &[u8]) -> &Arc<TxnRegion> {
        self.regions
            .iter()
            .find(|r| r.contains(row_key))
            .expect("Regions cover the whole key space")
    }

    /// A read controller over the cluster's store.
    pub fn read_controller(&self) -> ReadController {
        ReadController::new(
            Arc::clone(self.harness.txns()),
            self.resolver.clone(),
            Arc::clone(&self.read_resolver),
        )
    }

    /// The value of `row_key` visible to `reader`.
    pub fn get(&self, reader: &TxnView, row_key: &[u8]) -> Option<Bytes> {
        let region = self.region_for(row_key);
        self.read_controller()
            .get(reader, region.cells(), row_key)
            .expect("Read failed")
            .map(|kv| kv.value().clone())
    }

    /// Every row visible to `reader`, in key order.
    pub fn scan(&self, reader: &TxnView) -> Vec<KvPair> {
        let controller = self.read_controller();
        self.regions
            .iter()
            .flat_map(|region| {
                controller
                    .scan(reader, region.cells(), b"", None)
                    .expect("Scan failed")
            })
            .collect()
    }
}

impl BulkWriter for Cluster {
    fn write(
        &self,
        partition: &str,
        txn: &TxnView,
        rows: &[KvPair],
    ) -> PipelineResult<Vec<OperationStatus>> {
        let index = self
            .by_name
            .get(partition)
            .ok_or_else(|| PipelineError::transport(partition, "no such region"))?;
        Ok(self.regions[*index].apply_batch(txn, rows))
    }
}

impl PartitionLocator for Cluster {
    fn locate(&self, row_key: &[u8]) -> PipelineResult<String> {
        self.regions
            .iter()
            .find(|r| r.contains(row_key))
            .map(|r| r.name().to_string())
            .ok_or_else(|| PipelineError::locate("key outside every region"))
    }
}

/// One scripted fault.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Replace the status of the row with this key.
    Row {
        /// Row the fault applies to.
        row_key: Bytes,
        /// Status reported instead of writing the row.
        status: OperationStatus,
    },
    /// Fail the next batch sent to this partition.
    Batch {
        /// Partition the fault applies to.
        partition: String,
    },
}

/// Wraps a transport and injects scripted faults, each consumed once.
///
/// Rows hit by a row fault are not forwarded to the inner transport.
pub struct FaultInjectingWriter<W> {
    inner: W,
    faults: Mutex<Vec<Fault>>,
    batches: AtomicU64,
    injected: AtomicU64,
}

impl<W: BulkWriter> FaultInjectingWriter<W> {
    /// Wraps `inner` with no faults scheduled.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            batches: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Schedules `status` for the next write of `row_key`.
    pub fn fail_row(&self, row_key: impl Into<Bytes>, status: OperationStatus) {
        self.faults.lock().push(Fault::Row {
            row_key: row_key.into(),
            status,
        });
    }

    /// Schedules a transport error for the next batch to `partition`.
    pub fn fail_batch(&self, partition: impl Into<String>) {
        self.faults.lock().push(Fault::Batch {
            partition: partition.into(),
        });
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &W {
        &self.inner
    }

    /// Batches received, faulted or not.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Faults consumed so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_batch_fault(&self, partition: &str) -> bool {
        let mut faults = self.faults.lock();
        let found = faults
            .iter()
            .position(|f| matches!(f, Fault::Batch { partition: p } if p == partition));
        found.map(|i| faults.remove(i)).is_some()
    }

    fn take_row_fault(&self, row_key: &[u8]) -> Option<OperationStatus> {
        let mut faults = self.faults.lock();
        let found = faults
            .iter()
            .position(|f| matches!(f, Fault::Row { row_key: k, .. } if &k[..] == row_key))?;
        match faults.remove(found) {
            Fault::Row { status, .. } => Some(status),
            Fault::Batch { .. } => None,
        }
    }
}

impl<W: BulkWriter> BulkWriter for FaultInjectingWriter<W> {
    fn write(
        &self,
        partition: &str,
        txn: &TxnView,
        rows: &[KvPair],
    ) -> PipelineResult<Vec<OperationStatus>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.take_batch_fault(partition) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(PipelineError::transport(partition, "injected transport failure"));
        }

        let mut statuses: Vec<Option<OperationStatus>> = rows
            .iter()
            .map(|kv| self.take_row_fault(kv.row_key()))
            .collect();
        let injected = statuses.iter().filter(|s| s.is_some()).count();
        self.injected.fetch_add(injected as u64, Ordering::SeqCst);

        let forwarded: Vec<KvPair> = rows
            .iter()
            .zip(&statuses)
            .filter(|(_, s)| s.is_none())
            .map(|(kv, _)| kv.clone())
            .collect();
        let mut results = if forwarded.is_empty() {
            Vec::new()
        } else {
            self.inner.write(partition, txn, &forwarded)?
        }
        .into_iter();

        for status in &mut statuses {
            if status.is_none() {
                *status = results.next();
            }
        }
        Ok(statuses
            .into_iter()
            .map(|s| s.unwrap_or_else(|| OperationStatus::failure("transport returned too few statuses")))
            .collect())
    }
}

impl<W: PartitionLocator> PartitionLocator for FaultInjectingWriter<W> {
    fn locate(&self, row_key: &[u8]) -> PipelineResult<String> {
        self.inner.locate(row_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitx_core::TxnState;

    #[test]
    fn harness_ids_follow_timestamps() {
        let harness = TxnHarness::memory();
        let a = harness.begin();
        let b = harness.begin_child(&a);
        assert_eq!(a.txn_id, TxnId(1));
        assert_eq!(b.parent, Some(a.txn_id));
        assert_eq!(harness.commit(&b), Timestamp(3));
        harness.rollback(&a);
        assert_eq!(harness.txns().get_state(a.txn_id).unwrap(), TxnState::RolledBack);
    }

    #[test]
    fn file_harness_survives_reopen() {
        let harness = TxnHarness::file();
        let committed = harness.begin();
        let commit_ts = harness.commit(&committed);
        let active = harness.begin();

        let harness = harness.reopen();
        assert_eq!(
            harness.txns().get_commit_timestamp(committed.txn_id).unwrap(),
            Some(commit_ts)
        );
        assert_eq!(harness.txns().get_state(active.txn_id).unwrap(), TxnState::Active);
        assert!(harness.begin().txn_id > active.txn_id);
    }

    #[test]
    fn cluster_routes_by_split_points() {
        let cluster = Cluster::new(&[b"m"]);
        assert_eq!(cluster.locate(b"a").unwrap(), "region-0");
        assert_eq!(cluster.locate(b"m").unwrap(), "region-1");
        assert_eq!(cluster.locate(b"").unwrap(), "region-0");

        let txn = cluster.harness().begin();
        let err = cluster.write("region-9", &txn, &[]).unwrap_err();
        assert!(matches!(err, PipelineError::Transport { .. }));
    }

    #[test]
    fn faults_are_consumed_once() {
        let cluster = Cluster::new(&[]);
        let txn = cluster.harness().begin();
        let writer = FaultInjectingWriter::new(cluster);
        writer.fail_row(&b"b"[..], OperationStatus::NotRun);
        writer.fail_batch("region-0");

        let rows = [
            KvPair::upsert(&b"a"[..], &b"1"[..]),
            KvPair::upsert(&b"b"[..], &b"2"[..]),
        ];
        assert!(writer.write("region-0", &txn, &rows).is_err());
        assert_eq!(
            writer.write("region-0", &txn, &rows).unwrap(),
            vec![OperationStatus::Success, OperationStatus::NotRun]
        );
        assert_eq!(
            writer.write("region-0", &txn, &rows[1..]).unwrap(),
            vec![OperationStatus::Success]
        );
        assert_eq!(writer.injected(), 2);
        assert_eq!(writer.batches(), 3);
    }
}
