//! Per-reader visibility decisions over multi-version cells.

use crate::error::CoreResult;
use crate::filter::read_resolver::ReadResolver;
use crate::resolver::TxnResolver;
use crate::txn::{TransactionStore, TxnChain, TxnView, WriterFate};
use crate::types::{Timestamp, TxnId};
use bytes::Bytes;
use sitx_storage::Cell;
use std::collections::HashMap;
use std::sync::Arc;

/// Decides which cell versions one reading transaction sees.
///
/// A filter is built for one reader and one read. It loads the reader's
/// parent chain once and memoizes what it learns about each writer, so a scan
/// touching many cells of the same writer asks the transaction store once.
///
/// Along the way it hands stale state to the side:
///
/// - cells of rolled-back writers go to the [`ReadResolver`] for deletion;
/// - committed cells without a cached commit timestamp go to the
///   [`ReadResolver`] for caching;
/// - writers whose commit was found by walking the parent chain go to the
///   [`TxnResolver`] so the next reader finds a global commit timestamp;
/// - timed-out writers are treated as rolled back and go to the
///   [`TxnResolver`] for an actual rollback.
pub struct TxnFilter {
    chain: TxnChain,
    store: Arc<dyn TransactionStore>,
    resolver: Option<Arc<TxnResolver>>,
    read_resolver: Arc<dyn ReadResolver>,
    fates: HashMap<TxnId, WriterFate>,
}

impl TxnFilter {
    /// Creates a filter for `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader's parent chain cannot be loaded.
    pub fn new(
        reader: TxnView,
        store: Arc<dyn TransactionStore>,
        resolver: Option<Arc<TxnResolver>>,
        read_resolver: Arc<dyn ReadResolver>,
    ) -> CoreResult<Self> {
        let chain = TxnChain::load(store.as_ref(), reader)?;
        Ok(Self {
            chain,
            store,
            resolver,
            read_resolver,
            fates: HashMap::new(),
        })
    }

    /// The reading transaction.
    #[must_use]
    pub fn reader(&self) -> &TxnView {
        self.chain.view()
    }

    /// Works out the fate of the writer of `cell` and hands off stale state.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer cannot be read from the store.
    pub fn fate(&mut self, row_key: &Bytes, cell: &Cell) -> CoreResult<WriterFate> {
        let writer = TxnId(cell.txn_id);
        if let Some(commit) = cell.commit_timestamp {
            if !self.chain.contains(writer) {
                return Ok(WriterFate::Committed {
                    commit_timestamp: Timestamp(commit),
                    via_parent_chain: false,
                });
            }
        }
        let fate = match self.fates.get(&writer) {
            Some(fate) => *fate,
            None => {
                let fate = self.chain.resolve_writer(self.store.as_ref(), writer)?;
                self.on_first_sight(writer, fate);
                self.fates.insert(writer, fate);
                fate
            }
        };
        match fate {
            WriterFate::RolledBack => self.read_resolver.resolve_rolled_back(row_key, writer),
            WriterFate::Committed {
                commit_timestamp, ..
            } => self
                .read_resolver
                .resolve_committed(row_key, writer, commit_timestamp),
            _ => {}
        }
        Ok(fate)
    }

    fn on_first_sight(&self, writer: TxnId, fate: WriterFate) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        match fate {
            WriterFate::Committed {
                via_parent_chain: true,
                ..
            } => resolver.resolve_global_commit_timestamp(&self.store, writer, true),
            WriterFate::Active {
                txn_id,
                timed_out: true,
            } => resolver.resolve_timed_out(&self.store, txn_id, true),
            _ => {}
        }
    }

    /// Returns true if the reader sees `cell`.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer cannot be read from the store.
    pub fn is_visible(&mut self, row_key: &Bytes, cell: &Cell) -> CoreResult<bool> {
        let fate = self.fate(row_key, cell)?;
        Ok(fate.is_visible_to(self.chain.view()))
    }

    /// Returns the version the reader sees as the row's current value, or
    /// `None` if there is none or it is a tombstone.
    ///
    /// `cells` must be newest first. Versions older than the first visible
    /// one are not examined.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer cannot be read from the store.
    pub fn filter_row(&mut self, row_key: &Bytes, cells: &[Cell]) -> CoreResult<Option<Cell>> {
        for cell in cells {
            if self.is_visible(row_key, cell)? {
                return Ok((!cell.is_tombstone()).then(|| cell.clone()));
            }
        }
        Ok(None)
    }

    /// Returns every version the reader sees, newest first, tombstones
    /// included.
    ///
    /// # Errors
    ///
    /// Returns an error if a writer cannot be read from the store.
    pub fn visible_versions(&mut self, row_key: &Bytes, cells: &[Cell]) -> CoreResult<Vec<Cell>> {
        let mut visible = Vec::new();
        for cell in cells {
            if self.is_visible(row_key, cell)? {
                visible.push(cell.clone());
            }
        }
        Ok(visible)
    }
}
