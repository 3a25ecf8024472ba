//! Storage errors.

use thiserror::Error;

/// Result alias for storage calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of a log backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying file failed.
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A read asked for bytes the log does not hold.
    #[error("range {offset}+{len} is outside a log of {log_len} bytes")]
    OutOfRange {
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        len: usize,
        /// Log length at the time of the read.
        log_len: u64,
    },

    /// The backend no longer accepts appends.
    #[error("log backend is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn check_range(offset: u64, len: usize, log_len: u64) -> Result<(), Self> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= log_len => Ok(()),
            _ => Err(Self::OutOfRange {
                offset,
                len,
                log_len,
            }),
        }
    }
}
