//! Core type definitions for sitx.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transaction.
///
/// Ids are allocated from the same source as timestamps, so a root
/// transaction's id usually equals its begin timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// A logical timestamp on the global begin/commit timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The smallest timestamp.
    pub const MIN: Self = Self(0);
    /// The largest timestamp.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new timestamp.
    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    /// Returns the raw timestamp value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

/// How much of other transactions' work a reader observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Writers committed at or before the reader's begin timestamp.
    #[default]
    SnapshotIsolation,
    /// Every committed writer, whatever its commit timestamp.
    ReadCommitted,
    /// Committed writers plus writers that are still active.
    ReadUncommitted,
}

/// Lifecycle state of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Still running; the only non-terminal state.
    Active,
    /// Committed. Terminal.
    Committed,
    /// Rolled back. Terminal.
    RolledBack,
}

impl TxnState {
    /// Returns true for `Committed` and `RolledBack`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_id_ordering() {
        assert!(TxnId::new(1) < TxnId::new(2));
        assert_eq!(format!("{}", TxnId::new(7)), "txn:7");
    }

    #[test]
    fn terminal_states() {
        assert!(!TxnState::Active.is_terminal());
        assert!(TxnState::Committed.is_terminal());
        assert!(TxnState::RolledBack.is_terminal());
        assert_eq!(TxnState::RolledBack.to_string(), "ROLLEDBACK");
    }

    #[test]
    fn default_isolation_is_snapshot() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::SnapshotIsolation);
    }
}
