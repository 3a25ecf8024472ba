//! Parent chains and what a writer's chain means to a given transaction.

use crate::error::{CoreError, CoreResult};
use crate::txn::view::TxnView;
use crate::txn::TransactionStore;
use crate::types::{IsolationLevel, Timestamp, TxnId, TxnState};

/// Guards against cycles in corrupted parent links.
pub(crate) const MAX_CHAIN_DEPTH: usize = 1024;

/// Where a writer's parent chain ends up, seen from one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterFate {
    /// The writer is the transaction itself or one of its ancestors.
    Own,
    /// The writer's chain committed up into `ancestor`, which is on the
    /// transaction's own chain. `commit_timestamp` is the commit of the chain
    /// element directly below `ancestor`.
    CommittedInto {
        /// Ancestor the work was committed into.
        ancestor: TxnId,
        /// Commit timestamp into that ancestor.
        commit_timestamp: Timestamp,
    },
    /// Every element up to the root committed.
    Committed {
        /// The root's commit timestamp.
        commit_timestamp: Timestamp,
        /// True when this was found by walking parents rather than from a
        /// cached global commit timestamp.
        via_parent_chain: bool,
    },
    /// Some element of the chain is still active.
    Active {
        /// The active element.
        txn_id: TxnId,
        /// Whether that element missed its keep-alive deadline.
        timed_out: bool,
    },
    /// Some element of the chain rolled back.
    RolledBack,
}

impl WriterFate {
    /// Returns true if `reader` sees work with this fate.
    #[must_use]
    pub fn is_visible_to(&self, reader: &TxnView) -> bool {
        let snapshot = reader.isolation == IsolationLevel::SnapshotIsolation;
        match *self {
            Self::Own => true,
            Self::CommittedInto {
                ancestor,
                commit_timestamp,
            } => {
                ancestor == reader.txn_id
                    || !snapshot
                    || commit_timestamp <= reader.begin_timestamp
            }
            Self::Committed {
                commit_timestamp, ..
            } => !snapshot || commit_timestamp <= reader.begin_timestamp,
            Self::Active { timed_out, .. } => {
                !timed_out && reader.isolation == IsolationLevel::ReadUncommitted
            }
            Self::RolledBack => false,
        }
    }

    /// Returns true if `writer` writing over work with this fate is a
    /// write/write conflict. Always judged under snapshot isolation.
    #[must_use]
    pub fn conflicts_with(&self, writer: &TxnView) -> bool {
        match *self {
            Self::Own | Self::RolledBack => false,
            Self::CommittedInto {
                ancestor,
                commit_timestamp,
            } => ancestor != writer.txn_id && commit_timestamp > writer.begin_timestamp,
            Self::Committed {
                commit_timestamp, ..
            } => commit_timestamp > writer.begin_timestamp,
            Self::Active { timed_out, .. } => !timed_out,
        }
    }

    /// Returns true if the work is effectively gone: rolled back, or left by
    /// a transaction that timed out.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            Self::RolledBack | Self::Active {
                timed_out: true,
                ..
            }
        )
    }
}

/// A transaction together with the ids of its ancestors, nearest first.
#[derive(Debug, Clone)]
pub struct TxnChain {
    view: TxnView,
    ids: Vec<TxnId>,
}

impl TxnChain {
    /// Loads the ancestor ids of `view` from `store`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing ancestor and `InvalidOperation` for a
    /// cyclic or implausibly deep chain.
    pub fn load(store: &dyn TransactionStore, view: TxnView) -> CoreResult<Self> {
        let mut ids = vec![view.txn_id];
        let mut parent = view.parent;
        while let Some(id) = parent {
            if ids.contains(&id) || ids.len() > MAX_CHAIN_DEPTH {
                return Err(CoreError::invalid_operation(format!(
                    "parent chain of {} is cyclic or too deep",
                    view.txn_id
                )));
            }
            ids.push(id);
            parent = store.get_transaction(id)?.parent;
        }
        Ok(Self { view, ids })
    }

    /// The transaction the chain belongs to.
    #[must_use]
    pub fn view(&self) -> &TxnView {
        &self.view
    }

    /// Ids on the chain, starting with the transaction itself.
    #[must_use]
    pub fn ids(&self) -> &[TxnId] {
        &self.ids
    }

    /// Returns true if `txn_id` is the transaction or one of its ancestors.
    #[must_use]
    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.ids.contains(&txn_id)
    }

    /// Walks `writer`'s parent chain until it is decided.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain element cannot be read.
    pub fn resolve_writer(
        &self,
        store: &dyn TransactionStore,
        writer: TxnId,
    ) -> CoreResult<WriterFate> {
        if self.contains(writer) {
            return Ok(WriterFate::Own);
        }
        let mut current = store.get_transaction(writer)?;
        let mut below: Option<Timestamp> = None;
        let mut depth = 0usize;
        loop {
            if let Some(commit_timestamp) = below {
                if self.contains(current.txn_id) {
                    return Ok(WriterFate::CommittedInto {
                        ancestor: current.txn_id,
                        commit_timestamp,
                    });
                }
            }
            match current.state {
                TxnState::RolledBack => return Ok(WriterFate::RolledBack),
                TxnState::Active => {
                    let timed_out = store.is_timed_out(current.txn_id)?;
                    return Ok(WriterFate::Active {
                        txn_id: current.txn_id,
                        timed_out,
                    });
                }
                TxnState::Committed => {}
            }
            if let Some(global) = current.global_commit_timestamp {
                return Ok(WriterFate::Committed {
                    commit_timestamp: global,
                    via_parent_chain: false,
                });
            }
            let commit = current.commit_timestamp.ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "{} is committed without a commit timestamp",
                    current.txn_id
                ))
            })?;
            let Some(parent) = current.parent else {
                return Ok(WriterFate::Committed {
                    commit_timestamp: commit,
                    via_parent_chain: depth > 0,
                });
            };
            depth += 1;
            if depth > MAX_CHAIN_DEPTH {
                return Err(CoreError::invalid_operation(format!(
                    "parent chain of {writer} is cyclic or too deep"
                )));
            }
            below = Some(commit);
            current = store.get_transaction(parent)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxnConfig;
    use crate::txn::TxnStore;

    fn begin(store: &TxnStore, id: u64, parent: Option<u64>) -> TxnView {
        let mut view = TxnView::new(TxnId(id), Timestamp(id));
        if let Some(p) = parent {
            view = view.with_parent(TxnId(p));
        }
        store.record_transaction(&view).unwrap();
        view
    }

    fn chain(store: &TxnStore, view: &TxnView) -> TxnChain {
        TxnChain::load(store, view.clone()).unwrap()
    }

    #[test]
    fn load_collects_ancestors() {
        let store = TxnStore::in_memory(TxnConfig::default());
        begin(&store, 1, None);
        begin(&store, 2, Some(1));
        let leaf = begin(&store, 3, Some(2));

        let chain = chain(&store, &leaf);
        assert_eq!(chain.ids(), &[TxnId(3), TxnId(2), TxnId(1)]);
        assert!(chain.contains(TxnId(1)));
        assert!(!chain.contains(TxnId(4)));
    }

    #[test]
    fn own_and_ancestor_writes() {
        let store = TxnStore::in_memory(TxnConfig::default());
        begin(&store, 1, None);
        let child = begin(&store, 2, Some(1));
        let chain = chain(&store, &child);

        assert_eq!(chain.resolve_writer(&store, TxnId(2)).unwrap(), WriterFate::Own);
        assert_eq!(chain.resolve_writer(&store, TxnId(1)).unwrap(), WriterFate::Own);
    }

    #[test]
    fn committed_root_and_uncommitted_root() {
        let store = TxnStore::in_memory(TxnConfig::default());
        begin(&store, 1, None);
        begin(&store, 2, Some(1));
        let reader = begin(&store, 10, None);
        let chain = chain(&store, &reader);

        store.record_commit(TxnId(2), Timestamp(3)).unwrap();
        assert_eq!(
            chain.resolve_writer(&store, TxnId(2)).unwrap(),
            WriterFate::Active {
                txn_id: TxnId(1),
                timed_out: false
            }
        );

        store.record_commit(TxnId(1), Timestamp(5)).unwrap();
        assert_eq!(
            chain.resolve_writer(&store, TxnId(2)).unwrap(),
            WriterFate::Committed {
                commit_timestamp: Timestamp(5),
                via_parent_chain: true
            }
        );

        store
            .record_global_commit_timestamp(TxnId(2), Timestamp(5))
            .unwrap();
        assert_eq!(
            chain.resolve_writer(&store, TxnId(2)).unwrap(),
            WriterFate::Committed {
                commit_timestamp: Timestamp(5),
                via_parent_chain: false
            }
        );
    }

    #[test]
    fn rolled_back_ancestor_kills_child() {
        let store = TxnStore::in_memory(TxnConfig::default());
        begin(&store, 1, None);
        begin(&store, 2, Some(1));
        let reader = begin(&store, 10, None);
        store.record_commit(TxnId(2), Timestamp(3)).unwrap();
        store.record_rollback(TxnId(1)).unwrap();

        let fate = chain(&store, &reader)
            .resolve_writer(&store, TxnId(2))
            .unwrap();
        assert_eq!(fate, WriterFate::RolledBack);
        assert!(fate.is_dead());
        assert!(!fate.is_visible_to(&reader));
    }

    #[test]
    fn sibling_committed_into_shared_parent() {
        let store = TxnStore::in_memory(TxnConfig::default());
        let parent = begin(&store, 1, None);
        begin(&store, 2, Some(1));
        let late_reader = begin(&store, 5, Some(1));
        store.record_commit(TxnId(2), Timestamp(4)).unwrap();

        let fate = chain(&store, &late_reader)
            .resolve_writer(&store, TxnId(2))
            .unwrap();
        assert_eq!(
            fate,
            WriterFate::CommittedInto {
                ancestor: TxnId(1),
                commit_timestamp: Timestamp(4)
            }
        );
        assert!(fate.is_visible_to(&late_reader));
        assert!(fate.is_visible_to(&parent));
        assert!(!fate.conflicts_with(&parent));
    }

    #[test]
    fn visibility_by_isolation_level() {
        let committed_late = WriterFate::Committed {
            commit_timestamp: Timestamp(20),
            via_parent_chain: false,
        };
        let active = WriterFate::Active {
            txn_id: TxnId(7),
            timed_out: false,
        };
        let si = TxnView::new(TxnId(10), Timestamp(10));
        let rc = si.clone().with_isolation(IsolationLevel::ReadCommitted);
        let ru = si.clone().with_isolation(IsolationLevel::ReadUncommitted);

        assert!(!committed_late.is_visible_to(&si));
        assert!(committed_late.is_visible_to(&rc));
        assert!(!active.is_visible_to(&rc));
        assert!(active.is_visible_to(&ru));
        assert!(committed_late.conflicts_with(&si));
        assert!(active.conflicts_with(&ru));

        let timed_out = WriterFate::Active {
            txn_id: TxnId(7),
            timed_out: true,
        };
        assert!(!timed_out.is_visible_to(&ru));
        assert!(!timed_out.conflicts_with(&si));
    }
}
