//! Error types for the write pipeline.

use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised by buffers, writers and the coordinator.
///
/// Per-row outcomes are never reported here; they travel as
/// [`OperationStatus`](sitx_core::OperationStatus) values.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Error from the transaction layer.
    #[error("core error: {0}")]
    Core(#[from] sitx_core::CoreError),

    /// I/O error, typically a failed worker spawn.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A flush would exceed the per-buffer in-flight limit and the
    /// backpressure policy is `Reject`. The pending rows stay buffered.
    #[error("flush to {partition} rejected: {in_flight} flushes in flight, limit {limit}")]
    Rejected {
        /// Destination of the buffer.
        partition: String,
        /// Flushes in flight when the flush was attempted.
        in_flight: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The coordinator or its worker pool has been shut down.
    #[error("write pipeline is shut down")]
    Shutdown,

    /// The buffer has already been closed.
    #[error("call buffer for {partition} is closed")]
    Closed {
        /// Destination of the buffer.
        partition: String,
    },

    /// A flush job ended without reporting a result.
    #[error("flush worker exited without a result")]
    WorkerLost,

    /// The pre-flush hook refused a batch.
    #[error("pre-flush hook failed: {message}")]
    Hook {
        /// Description of the failure.
        message: String,
    },

    /// Locating the partition of a row failed.
    #[error("cannot locate partition: {message}")]
    Locate {
        /// Description of the failure.
        message: String,
    },

    /// The transport failed to deliver a batch.
    #[error("bulk write to {partition} failed: {message}")]
    Transport {
        /// Destination of the batch.
        partition: String,
        /// Description of the failure.
        message: String,
    },
}

impl PipelineError {
    /// Creates a hook error.
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook {
            message: message.into(),
        }
    }

    /// Creates a locate error.
    pub fn locate(message: impl Into<String>) -> Self {
        Self::Locate {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(partition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            partition: partition.into(),
            message: message.into(),
        }
    }
}
