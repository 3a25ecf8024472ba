//! Entry point of the transactional read path.

use crate::error::CoreResult;
use crate::filter::packed::{ColumnMask, PackedTxnFilter};
use crate::filter::read_resolver::ReadResolver;
use crate::filter::visibility::TxnFilter;
use crate::resolver::TxnResolver;
use crate::txn::{TransactionStore, TxnView};
use bytes::Bytes;
use sitx_storage::{CellValue, KvPair, ReadOptions, VersionedStore};
use std::sync::Arc;

/// Prepares reads and builds filters for them.
///
/// Visibility is decided by the filters, never by the storage layer's own
/// version and time-range selection, so every read must fetch all versions
/// over the whole time range first.
#[derive(Clone)]
pub struct ReadController {
    store: Arc<dyn TransactionStore>,
    resolver: Option<Arc<TxnResolver>>,
    read_resolver: Arc<dyn ReadResolver>,
}

impl ReadController {
    /// Creates a controller.
    pub fn new(
        store: Arc<dyn TransactionStore>,
        resolver: Option<Arc<TxnResolver>>,
        read_resolver: Arc<dyn ReadResolver>,
    ) -> Self {
        Self {
            store,
            resolver,
            read_resolver,
        }
    }

    /// Widens a point read to every version over the whole time range.
    pub fn pre_process_get(&self, options: &mut ReadOptions) {
        widen(options);
    }

    /// Widens a scan to every version over the whole time range.
    pub fn pre_process_scan(&self, options: &mut ReadOptions) {
        widen(options);
    }

    /// Builds a visibility filter for `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader's parent chain cannot be loaded.
    pub fn new_filter(&self, reader: &TxnView) -> CoreResult<TxnFilter> {
        TxnFilter::new(
            reader.clone(),
            Arc::clone(&self.store),
            self.resolver.clone(),
            Arc::clone(&self.read_resolver),
        )
    }

    /// Builds a packed-row filter for `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader's parent chain cannot be loaded.
    pub fn new_packed_filter(
        &self,
        reader: &TxnView,
        mask: ColumnMask,
        count_star: bool,
    ) -> CoreResult<PackedTxnFilter> {
        Ok(PackedTxnFilter::new(
            self.new_filter(reader)?,
            mask,
            count_star,
        ))
    }

    /// Reads the value of one row as `reader` sees it.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer cannot be read from the store.
    pub fn get(
        &self,
        reader: &TxnView,
        cells: &VersionedStore,
        row_key: &[u8],
    ) -> CoreResult<Option<KvPair>> {
        let mut options = ReadOptions::default();
        self.pre_process_get(&mut options);
        let versions = cells.get(row_key, &options);
        let key = Bytes::copy_from_slice(row_key);
        let mut filter = self.new_filter(reader)?;
        Ok(filter
            .filter_row(&key, &versions)?
            .and_then(|cell| visible_pair(key, cell.value)))
    }

    /// Scans rows in `[start, end)` as `reader` sees them, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer cannot be read from the store.
    pub fn scan(
        &self,
        reader: &TxnView,
        cells: &VersionedStore,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> CoreResult<Vec<KvPair>> {
        let mut options = ReadOptions::default();
        self.pre_process_scan(&mut options);
        let mut filter = self.new_filter(reader)?;
        let mut rows = Vec::new();
        for (key, versions) in cells.scan(start, end, &options) {
            if let Some(cell) = filter.filter_row(&key, &versions)? {
                rows.extend(visible_pair(key, cell.value));
            }
        }
        Ok(rows)
    }
}

fn widen(options: &mut ReadOptions) {
    options.return_all_versions().set_time_range(0, u64::MAX);
}

/// Read results are handed back as upserts of the visible value.
fn visible_pair(key: Bytes, value: CellValue) -> Option<KvPair> {
    match value {
        CellValue::Put(value) => Some(KvPair::upsert(key, value)),
        CellValue::Tombstone => None,
    }
}
