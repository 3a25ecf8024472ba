//! Multi-version cell store for one storage partition.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Payload of one cell version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    /// A written value.
    Put(Bytes),
    /// A delete marker.
    Tombstone,
}

/// One version of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Version timestamp; the writer's begin timestamp.
    pub timestamp: u64,
    /// Raw id of the writing transaction.
    pub txn_id: u64,
    /// The payload.
    pub value: CellValue,
    /// Commit timestamp of the writer, once someone has cached it here.
    pub commit_timestamp: Option<u64>,
}

impl Cell {
    /// Creates a value cell.
    #[must_use]
    pub fn put(timestamp: u64, txn_id: u64, value: Bytes) -> Self {
        Self {
            timestamp,
            txn_id,
            value: CellValue::Put(value),
            commit_timestamp: None,
        }
    }

    /// Creates a tombstone cell.
    #[must_use]
    pub fn tombstone(timestamp: u64, txn_id: u64) -> Self {
        Self {
            timestamp,
            txn_id,
            value: CellValue::Tombstone,
            commit_timestamp: None,
        }
    }

    /// Returns true for delete markers.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, CellValue::Tombstone)
    }
}

/// Version and time-range selection for a read.
///
/// The default behaves like a plain key-value get: only the newest version,
/// over the whole time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Return every version instead of only the newest.
    pub all_versions: bool,
    /// Inclusive lower bound on cell timestamps.
    pub min_timestamp: u64,
    /// Exclusive upper bound on cell timestamps.
    pub max_timestamp: u64,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            all_versions: false,
            min_timestamp: 0,
            max_timestamp: u64::MAX,
        }
    }
}

impl ReadOptions {
    /// Requests every stored version.
    pub fn return_all_versions(&mut self) -> &mut Self {
        self.all_versions = true;
        self
    }

    /// Restricts cells to `[min, max)`.
    pub fn set_time_range(&mut self, min: u64, max: u64) -> &mut Self {
        self.min_timestamp = min;
        self.max_timestamp = max;
        self
    }

    fn admits(&self, cell: &Cell) -> bool {
        cell.timestamp >= self.min_timestamp && cell.timestamp < self.max_timestamp
    }

    fn select(&self, cells: &[Cell]) -> Vec<Cell> {
        let admitted = cells.iter().filter(|c| self.admits(c)).cloned();
        if self.all_versions {
            admitted.collect()
        } else {
            admitted.take(1).collect()
        }
    }
}

/// In-memory multi-version store.
///
/// Rows are kept in key order; each row holds its versions sorted newest to
/// oldest by timestamp. A transaction has at most one version per row, so a
/// second write by the same transaction replaces its earlier cell.
#[derive(Debug, Default)]
pub struct VersionedStore {
    rows: RwLock<BTreeMap<Bytes, Vec<Cell>>>,
}

impl VersionedStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a cell version.
    pub fn put(&self, row_key: Bytes, cell: Cell) {
        let mut rows = self.rows.write();
        let versions = rows.entry(row_key).or_default();
        versions.retain(|c| c.txn_id != cell.txn_id);
        let at = versions
            .iter()
            .position(|c| c.timestamp < cell.timestamp)
            .unwrap_or(versions.len());
        versions.insert(at, cell);
    }

    /// Reads the versions of one row selected by `options`, newest first.
    #[must_use]
    pub fn get(&self, row_key: &[u8], options: &ReadOptions) -> Vec<Cell> {
        self.rows
            .read()
            .get(row_key)
            .map(|cells| options.select(cells))
            .unwrap_or_default()
    }

    /// Scans rows in `[start, end)` (`end = None` means unbounded).
    ///
    /// Rows with no version admitted by `options` are omitted.
    #[must_use]
    pub fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        options: &ReadOptions,
    ) -> Vec<(Bytes, Vec<Cell>)> {
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        self.rows
            .read()
            .range::<[u8], _>((Bound::Included(start), upper))
            .filter_map(|(key, cells)| {
                let selected = options.select(cells);
                (!selected.is_empty()).then(|| (key.clone(), selected))
            })
            .collect()
    }

    /// Removes the version written by `txn_id`. Returns false if absent.
    pub fn remove_version(&self, row_key: &[u8], txn_id: u64) -> bool {
        let mut rows = self.rows.write();
        let Some(cells) = rows.get_mut(row_key) else {
            return false;
        };
        let before = cells.len();
        cells.retain(|c| c.txn_id != txn_id);
        let removed = cells.len() != before;
        if cells.is_empty() {
            rows.remove(row_key);
        }
        removed
    }

    /// Caches the writer's commit timestamp on its cell. Returns false if the
    /// cell no longer exists.
    pub fn set_commit_timestamp(&self, row_key: &[u8], txn_id: u64, commit_timestamp: u64) -> bool {
        let mut rows = self.rows.write();
        rows.get_mut(row_key)
            .and_then(|cells| cells.iter_mut().find(|c| c.txn_id == txn_id))
            .map(|cell| cell.commit_timestamp = Some(commit_timestamp))
            .is_some()
    }

    /// Number of rows with at least one version.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Number of stored versions for `row_key`.
    #[must_use]
    pub fn version_count(&self, row_key: &[u8]) -> usize {
        self.rows.read().get(row_key).map_or(0, Vec::len)
    }
}
