//! Immutable transaction snapshots.

use crate::types::{IsolationLevel, Timestamp, TxnId, TxnState};
use serde::{Deserialize, Serialize};

/// A snapshot of one transaction record.
///
/// Views are what callers hold; the record itself lives in the partition of
/// the transaction store that owns its id. A view never changes after it is
/// handed out, so re-read it from the store to observe a later state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnView {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Begin timestamp; also the timestamp of every cell this transaction writes.
    pub begin_timestamp: Timestamp,
    /// Parent transaction for nested transactions.
    pub parent: Option<TxnId>,
    /// Set once the transaction commits.
    pub commit_timestamp: Option<Timestamp>,
    /// Root commit timestamp, cached once the whole parent chain has committed.
    pub global_commit_timestamp: Option<Timestamp>,
    /// Reader isolation level.
    pub isolation: IsolationLevel,
    /// Additive transactions do not conflict with each other on inserts.
    pub additive: bool,
    /// Lifecycle state.
    pub state: TxnState,
    /// Tables this transaction writes to.
    pub destination_tables: Vec<String>,
}

impl TxnView {
    /// Creates an active, non-additive, top-level view.
    #[must_use]
    pub fn new(txn_id: TxnId, begin_timestamp: Timestamp) -> Self {
        Self {
            txn_id,
            begin_timestamp,
            parent: None,
            commit_timestamp: None,
            global_commit_timestamp: None,
            isolation: IsolationLevel::default(),
            additive: false,
            state: TxnState::Active,
            destination_tables: Vec::new(),
        }
    }

    /// Sets the parent transaction.
    #[must_use]
    pub fn with_parent(mut self, parent: TxnId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets the isolation level.
    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Marks the transaction additive.
    #[must_use]
    pub fn additive(mut self, additive: bool) -> Self {
        self.additive = additive;
        self
    }

    /// Adds a destination table.
    #[must_use]
    pub fn with_destination_table(mut self, table: impl Into<String>) -> Self {
        self.destination_tables.push(table.into());
        self
    }

    /// Returns true while the transaction is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Returns true if the transaction writes to `table`.
    #[must_use]
    pub fn writes_to(&self, table: &str) -> bool {
        self.destination_tables.iter().any(|t| t == table)
    }

    /// Commit timestamp that readers outside the parent chain compare against.
    ///
    /// For a top-level transaction this is its commit timestamp. For a nested
    /// one it is the cached global commit timestamp, if resolved.
    #[must_use]
    pub fn effective_commit_timestamp(&self) -> Option<Timestamp> {
        if self.state != TxnState::Committed {
            return None;
        }
        match self.parent {
            None => self.commit_timestamp,
            Some(_) => self.global_commit_timestamp,
        }
    }
}
