//! Per-row mutation outcomes.
//!
//! Every mutation sent to a partition comes back with an [`OperationStatus`].
//! Statuses are plain values: `Success` and `NotRun` carry nothing, failures
//! carry a shared message, so cloning one is cheap and never allocates.
//!
//! When a row is attempted more than once within one logical write (retries,
//! or a pre-flush hook fanning one row out into several), the outcomes are
//! folded together with [`get_correct_status`]: the first recorded failure
//! sticks.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::sync::Arc;

/// Message used for additive write conflicts.
pub const ADDITIVE_WRITE_CONFLICT: &str = "additive transactions wrote the same row";

/// Distinguishes the kinds of `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Any failure the partition could not classify.
    Generic,
    /// Write/write conflict with another transaction.
    WriteConflict,
    /// Conflict between two additive transactions.
    AdditiveWriteConflict,
}

/// A failed row: kind plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    message: Arc<str>,
}

impl Failure {
    /// Returns the failure kind.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error taxonomy a status maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Lock or resource unavailable. Retryable.
    Transient,
    /// Unclassified failure. Retryable within the retry budget.
    Failure,
    /// Write/write conflict, additive or not. Never retried.
    Conflict,
    /// Column-family or type mismatch. Never retried.
    Schema,
    /// Internal invariant failed. Never retried.
    InternalInvariant,
}

/// Outcome of one mutation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// The row was written.
    Success,
    /// The row was not attempted, usually because its lock was held.
    NotRun,
    /// The row failed.
    Failure(Failure),
    /// The row targeted a column family the partition does not have.
    BadFamily(Arc<str>),
    /// The partition hit an internal sanity check.
    SanityCheckFailure(Arc<str>),
}

impl OperationStatus {
    /// Creates a generic failure.
    pub fn failure(message: impl Into<Arc<str>>) -> Self {
        Self::Failure(Failure {
            kind: FailureKind::Generic,
            message: message.into(),
        })
    }

    /// Creates a write/write conflict failure.
    pub fn write_conflict(message: impl Into<Arc<str>>) -> Self {
        Self::Failure(Failure {
            kind: FailureKind::WriteConflict,
            message: message.into(),
        })
    }

    /// Creates the additive write conflict failure.
    #[must_use]
    pub fn additive_write_conflict() -> Self {
        Self::Failure(Failure {
            kind: FailureKind::AdditiveWriteConflict,
            message: Arc::from(ADDITIVE_WRITE_CONFLICT),
        })
    }

    /// Creates a schema mismatch status.
    pub fn bad_family(message: impl Into<Arc<str>>) -> Self {
        Self::BadFamily(message.into())
    }

    /// Creates a sanity check failure.
    pub fn sanity_check_failure(message: impl Into<Arc<str>>) -> Self {
        Self::SanityCheckFailure(message.into())
    }

    /// Returns true for `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Maps the status onto the error taxonomy. `None` for `Success`.
    #[must_use]
    pub fn classify(&self) -> Option<ErrorClass> {
        match self {
            Self::Success => None,
            Self::NotRun => Some(ErrorClass::Transient),
            Self::Failure(failure) => Some(match failure.kind {
                FailureKind::Generic => ErrorClass::Failure,
                FailureKind::WriteConflict | FailureKind::AdditiveWriteConflict => {
                    ErrorClass::Conflict
                }
            }),
            Self::BadFamily(_) => Some(ErrorClass::Schema),
            Self::SanityCheckFailure(_) => Some(ErrorClass::InternalInvariant),
        }
    }

    /// Returns true if retrying the row could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classify(),
            Some(ErrorClass::Transient | ErrorClass::Failure)
        )
    }

    /// Converts a non-success status into the matching error.
    ///
    /// # Errors
    ///
    /// Returns an error for every status other than `Success`.
    pub fn into_result(self) -> CoreResult<()> {
        match self {
            Self::Success => Ok(()),
            Self::NotRun => Err(CoreError::NotRun),
            Self::Failure(failure) => {
                let message = failure.message.to_string();
                Err(match failure.kind {
                    FailureKind::Generic => CoreError::WriteFailed { message },
                    FailureKind::WriteConflict => CoreError::WriteConflict { message },
                    FailureKind::AdditiveWriteConflict => {
                        CoreError::AdditiveWriteConflict { message }
                    }
                })
            }
            Self::BadFamily(message) => Err(CoreError::BadFamily {
                message: message.to_string(),
            }),
            Self::SanityCheckFailure(message) => Err(CoreError::SanityCheck {
                message: message.to_string(),
            }),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::NotRun => f.write_str("NOT_RUN"),
            Self::Failure(failure) => write!(f, "FAILURE({})", failure.message),
            Self::BadFamily(message) => write!(f, "BAD_FAMILY({message})"),
            Self::SanityCheckFailure(message) => write!(f, "SANITY_CHECK_FAILURE({message})"),
        }
    }
}

/// Folds the outcome of another attempt at a row into its recorded outcome.
///
/// A recorded `Success` yields `status`; any other recorded outcome,
/// `NotRun` included, is returned unchanged.
#[must_use]
pub fn get_correct_status(status: OperationStatus, old_status: OperationStatus) -> OperationStatus {
    match old_status {
        OperationStatus::Success => status,
        _ => old_status,
    }
}
