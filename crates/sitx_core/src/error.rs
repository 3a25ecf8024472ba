//! Error types for sitx core.

use crate::types::{Timestamp, TxnId, TxnState};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in sitx core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sitx_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CBOR encoding or decoding of a log payload failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The transaction log is corrupted or has an unknown format.
    #[error("transaction log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A record for this id already exists.
    #[error("transaction {txn_id} already exists")]
    AlreadyExists {
        /// The duplicated id.
        txn_id: TxnId,
    },

    /// No record for this id.
    #[error("transaction {txn_id} not found")]
    NotFound {
        /// The missing id.
        txn_id: TxnId,
    },

    /// A terminal transaction was asked to change state.
    #[error("transaction {txn_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        /// The transaction.
        txn_id: TxnId,
        /// Its current state.
        from: TxnState,
        /// The requested state.
        to: TxnState,
    },

    /// A timestamp that is already set was asked to change.
    #[error("transaction {txn_id} already has {field} {existing}, refusing {requested}")]
    ConflictingTimestamp {
        /// The transaction.
        txn_id: TxnId,
        /// Which timestamp.
        field: &'static str,
        /// The recorded value.
        existing: Timestamp,
        /// The rejected value.
        requested: Timestamp,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// A row lock could not be acquired.
    #[error("could not acquire lock")]
    NotRun,

    /// A write collided with another transaction's write.
    #[error("write conflict: {message}")]
    WriteConflict {
        /// Conflict details.
        message: String,
    },

    /// Two additive transactions collided on a non-insert write.
    #[error("additive write conflict: {message}")]
    AdditiveWriteConflict {
        /// Conflict details.
        message: String,
    },

    /// The row was rejected because of a schema mismatch.
    #[error("no such column family: {message}")]
    BadFamily {
        /// Mismatch details.
        message: String,
    },

    /// An internal invariant failed on the partition.
    #[error("sanity check failure: {message}")]
    SanityCheck {
        /// Failure details.
        message: String,
    },

    /// Generic per-row failure reported by the partition.
    #[error("{message}")]
    WriteFailed {
        /// Failure details.
        message: String,
    },

    /// A background worker has been shut down.
    #[error("{component} is shut down")]
    Shutdown {
        /// The component that refused work.
        component: &'static str,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid state transition error.
    #[must_use]
    pub fn invalid_transition(txn_id: TxnId, from: TxnState, to: TxnState) -> Self {
        Self::InvalidStateTransition { txn_id, from, to }
    }

    /// Returns true for errors caused by caller misuse of the transaction
    /// store rather than by data or I/O conditions.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. }
                | Self::InvalidStateTransition { .. }
                | Self::ConflictingTimestamp { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations() {
        assert!(CoreError::AlreadyExists { txn_id: TxnId(1) }.is_protocol_violation());
        assert!(
            CoreError::invalid_transition(TxnId(1), TxnState::Committed, TxnState::RolledBack)
                .is_protocol_violation()
        );
        assert!(!CoreError::NotFound { txn_id: TxnId(1) }.is_protocol_violation());
        assert!(!CoreError::NotRun.is_protocol_violation());
    }

    #[test]
    fn transition_message_names_both_states() {
        let err = CoreError::invalid_transition(TxnId(3), TxnState::RolledBack, TxnState::Committed);
        assert_eq!(
            err.to_string(),
            "transaction txn:3 cannot move from ROLLEDBACK to COMMITTED"
        );
    }
}
