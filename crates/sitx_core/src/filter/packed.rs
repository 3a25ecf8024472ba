//! Column-packed rows and the accumulating filter over them.
//!
//! A packed value is a run of `(column u16 LE, length u32 LE, bytes)`
//! entries. Rows are updated by writing a new version holding only the
//! changed columns, so a reader assembles a row by walking its visible
//! versions newest first and taking each column the first time it appears.

use crate::error::{CoreError, CoreResult};
use crate::filter::visibility::TxnFilter;
use bytes::{BufMut, Bytes, BytesMut};
use sitx_storage::{Cell, CellValue};
use std::collections::{BTreeMap, BTreeSet};

const ENTRY_HEADER: usize = 6;

/// Encodes columns into a packed value.
///
/// # Errors
///
/// Returns a codec error if a column is longer than `u32::MAX` bytes.
pub fn encode_packed_row(columns: &[(u16, &[u8])]) -> CoreResult<Bytes> {
    let size = columns.iter().map(|(_, v)| ENTRY_HEADER + v.len()).sum();
    let mut out = BytesMut::with_capacity(size);
    for (column, value) in columns {
        let len = u32::try_from(value.len())
            .map_err(|_| CoreError::codec(format!("column {column} too large")))?;
        out.put_u16_le(*column);
        out.put_u32_le(len);
        out.put_slice(value);
    }
    Ok(out.freeze())
}

/// Which columns a read wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnMask {
    /// Every column present in the row.
    All,
    /// Only these columns.
    Columns(BTreeSet<u16>),
}

impl ColumnMask {
    /// Creates a mask selecting `columns`.
    pub fn of(columns: impl IntoIterator<Item = u16>) -> Self {
        Self::Columns(columns.into_iter().collect())
    }

    /// Returns true if `column` is selected.
    #[must_use]
    pub fn selects(&self, column: u16) -> bool {
        match self {
            Self::All => true,
            Self::Columns(columns) => columns.contains(&column),
        }
    }

    fn is_satisfied_by(&self, row: &PackedRow) -> bool {
        match self {
            Self::All => false,
            Self::Columns(columns) => columns.iter().all(|c| row.columns.contains_key(c)),
        }
    }
}

/// Assembled columns of one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedRow {
    columns: BTreeMap<u16, Bytes>,
}

impl PackedRow {
    /// Returns a column value.
    #[must_use]
    pub fn get(&self, column: u16) -> Option<&Bytes> {
        self.columns.get(&column)
    }

    /// Number of columns assembled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if no column was assembled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterates columns in column order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Bytes)> {
        self.columns.iter().map(|(c, v)| (*c, v))
    }

    /// Merges the selected columns of `value` that are not yet present.
    /// Excluded columns are skipped over without being copied.
    fn absorb(&mut self, value: &Bytes, mask: &ColumnMask) -> CoreResult<()> {
        let mut pos = 0usize;
        while pos < value.len() {
            if value.len() - pos < ENTRY_HEADER {
                return Err(CoreError::codec(format!(
                    "packed row truncated in entry header at byte {pos}"
                )));
            }
            let column = u16::from_le_bytes([value[pos], value[pos + 1]]);
            let len = u32::from_le_bytes([
                value[pos + 2],
                value[pos + 3],
                value[pos + 4],
                value[pos + 5],
            ]) as usize;
            let start = pos + ENTRY_HEADER;
            let end = start
                .checked_add(len)
                .filter(|end| *end <= value.len())
                .ok_or_else(|| {
                    CoreError::codec(format!("packed column {column} overruns the row"))
                })?;
            if mask.selects(column) {
                self.columns
                    .entry(column)
                    .or_insert_with(|| value.slice(start..end));
            }
            pos = end;
        }
        Ok(())
    }
}

type RowPredicate = Box<dyn Fn(&PackedRow) -> bool + Send>;

/// Visibility filter that also assembles packed rows.
pub struct PackedTxnFilter {
    filter: TxnFilter,
    mask: ColumnMask,
    count_star: bool,
    predicate: Option<RowPredicate>,
}

impl PackedTxnFilter {
    /// Wraps `filter`, assembling the columns in `mask`.
    ///
    /// With `count_star` the filter only decides whether a row exists and
    /// decodes nothing.
    #[must_use]
    pub fn new(filter: TxnFilter, mask: ColumnMask, count_star: bool) -> Self {
        Self {
            filter,
            mask,
            count_star,
            predicate: None,
        }
    }

    /// Drops assembled rows for which `predicate` returns false.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&PackedRow) -> bool + Send + 'static,
    ) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Returns the inner visibility filter.
    pub fn filter_mut(&mut self) -> &mut TxnFilter {
        &mut self.filter
    }

    /// Assembles the row the reader sees from `cells` (newest first).
    ///
    /// Returns `None` if the row does not exist for the reader or fails the
    /// predicate. In count-star mode an existing row comes back empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer cannot be read or a packed value is
    /// malformed.
    pub fn accumulate(&mut self, row_key: &Bytes, cells: &[Cell]) -> CoreResult<Option<PackedRow>> {
        let mut row = PackedRow::default();
        let mut exists = false;
        for cell in cells {
            if !self.filter.is_visible(row_key, cell)? {
                continue;
            }
            let CellValue::Put(value) = &cell.value else {
                break;
            };
            exists = true;
            if self.count_star {
                break;
            }
            row.absorb(value, &self.mask)?;
            if self.mask.is_satisfied_by(&row) {
                break;
            }
        }
        if !exists {
            return Ok(None);
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(&row) {
                return Ok(None);
            }
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxnConfig;
    use crate::filter::read_resolver::NoopReadResolver;
    use crate::txn::{TransactionStore, TxnStore, TxnView};
    use crate::types::{Timestamp, TxnId};
    use std::sync::Arc;

    fn pack(columns: &[(u16, &[u8])]) -> Bytes {
        encode_packed_row(columns).unwrap()
    }

    fn committed_cell(store: &TxnStore, id: u64, value: Bytes) -> Cell {
        store
            .record_transaction(&TxnView::new(TxnId(id), Timestamp(id)))
            .unwrap();
        store.record_commit(TxnId(id), Timestamp(id)).unwrap();
        Cell::put(id, id, value)
    }

    fn packed_filter(store: Arc<TxnStore>, mask: ColumnMask, count_star: bool) -> PackedTxnFilter {
        let reader = TxnView::new(TxnId(100), Timestamp(100));
        store.record_transaction(&reader).unwrap();
        let filter =
            TxnFilter::new(reader, store, None, Arc::new(NoopReadResolver)).unwrap();
        PackedTxnFilter::new(filter, mask, count_star)
    }

    #[test]
    fn encode_layout() {
        let bytes = pack(&[(1, &b"ab"[..]), (513, &b""[..])]);
        assert_eq!(
            bytes.as_ref(),
            &[1, 0, 2, 0, 0, 0, b'a', b'b', 1, 2, 0, 0, 0, 0]
        );
    }

    #[test]
    fn newest_version_wins_per_column() {
        let store = Arc::new(TxnStore::in_memory(TxnConfig::default()));
        let old = committed_cell(&store, 1, pack(&[(0, &b"a0"[..]), (1, &b"b0"[..]), (2, &b"c0"[..])]));
        let new = committed_cell(&store, 2, pack(&[(1, &b"b1"[..])]));
        let mut filter = packed_filter(Arc::clone(&store), ColumnMask::All, false);

        let row = filter
            .accumulate(&Bytes::from_static(b"k"), &[new, old])
            .unwrap()
            .unwrap();
        assert_eq!(row.len(), 3);
        assert_eq!(row.get(0).unwrap().as_ref(), b"a0");
        assert_eq!(row.get(1).unwrap().as_ref(), b"b1");
        assert_eq!(row.get(2).unwrap().as_ref(), b"c0");
    }

    #[test]
    fn mask_skips_columns_and_stops_early() {
        let store = Arc::new(TxnStore::in_memory(TxnConfig::default()));
        let old = Cell::put(1, 1, Bytes::from_static(b"not a packed row"));
        store
            .record_transaction(&TxnView::new(TxnId(1), Timestamp(1)))
            .unwrap();
        store.record_commit(TxnId(1), Timestamp(1)).unwrap();
        let new = committed_cell(&store, 2, pack(&[(4, &b"x"[..]), (7, &b"y"[..])]));
        let mut filter = packed_filter(Arc::clone(&store), ColumnMask::of([7]), false);

        let row = filter
            .accumulate(&Bytes::from_static(b"k"), &[new, old])
            .unwrap()
            .unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row.get(7).unwrap().as_ref(), b"y");
        assert!(row.get(4).is_none());
    }

    #[test]
    fn tombstone_stops_accumulation() {
        let store = Arc::new(TxnStore::in_memory(TxnConfig::default()));
        let old = committed_cell(&store, 1, pack(&[(0, &b"gone"[..])]));
        store
            .record_transaction(&TxnView::new(TxnId(2), Timestamp(2)))
            .unwrap();
        store.record_commit(TxnId(2), Timestamp(2)).unwrap();
        let tomb = Cell::tombstone(2, 2);
        let mut filter = packed_filter(Arc::clone(&store), ColumnMask::All, false);

        let key = Bytes::from_static(b"k");
        assert!(filter.accumulate(&key, &[tomb.clone(), old.clone()]).unwrap().is_none());

        let newer = committed_cell(&store, 3, pack(&[(1, &b"new"[..])]));
        let row = filter.accumulate(&key, &[newer, tomb, old]).unwrap().unwrap();
        assert_eq!(row.len(), 1);
        assert!(row.get(0).is_none());
    }

    #[test]
    fn count_star_decodes_nothing() {
        let store = Arc::new(TxnStore::in_memory(TxnConfig::default()));
        let cell = committed_cell(&store, 1, Bytes::from_static(b"\x01"));
        let mut filter = packed_filter(Arc::clone(&store), ColumnMask::All, true);

        let row = filter
            .accumulate(&Bytes::from_static(b"k"), &[cell])
            .unwrap()
            .unwrap();
        assert!(row.is_empty());
    }

    #[test]
    fn malformed_value_is_codec_error() {
        let store = Arc::new(TxnStore::in_memory(TxnConfig::default()));
        let cell = committed_cell(&store, 1, Bytes::from_static(&[0, 0, 9, 0, 0, 0, 1]));
        let mut filter = packed_filter(Arc::clone(&store), ColumnMask::All, false);
        assert!(matches!(
            filter.accumulate(&Bytes::from_static(b"k"), &[cell]),
            Err(CoreError::Codec { .. })
        ));
    }

    #[test]
    fn predicate_filters_rows() {
        let store = Arc::new(TxnStore::in_memory(TxnConfig::default()));
        let cell = committed_cell(&store, 1, pack(&[(0, &b"5"[..])]));
        let key = Bytes::from_static(b"k");

        let mut keep = packed_filter(Arc::clone(&store), ColumnMask::All, false)
            .with_predicate(|row| row.get(0).is_some_and(|v| v.as_ref() == b"5"));
        assert!(keep.accumulate(&key, &[cell.clone()]).unwrap().is_some());

        let reader = TxnView::new(TxnId(101), Timestamp(101));
        store.record_transaction(&reader).unwrap();
        let filter = TxnFilter::new(reader, store, None, Arc::new(NoopReadResolver)).unwrap();
        let mut drop_all =
            PackedTxnFilter::new(filter, ColumnMask::All, false).with_predicate(|_| false);
        assert!(drop_all.accumulate(&key, &[cell]).unwrap().is_none());
    }
}
