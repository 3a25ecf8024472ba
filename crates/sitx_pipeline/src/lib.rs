//! # sitx pipeline
//!
//! Client-side write path: mutations are batched per (partition, transaction)
//! in a [`CallBuffer`], flushed through a [`Writer`] that groups rows by
//! partition and retries the retryable ones, and accounted for by a shared
//! [`Monitor`].
//!
//! Partial failure is per row. Every submitted mutation gets exactly one
//! [`RowStatus`]; a conflict on one row never holds back its siblings.
//!
//! The transport ([`BulkWriter`]) and the key-to-partition mapping
//! ([`PartitionLocator`]) are supplied by the caller.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod config;
mod coordinator;
mod error;
mod monitor;
mod pool;
mod stats;
mod writer;

pub use buffer::{CallBuffer, PendingRow, PreFlushHook, RowStatus};
pub use config::{BackpressurePolicy, BufferConfiguration, PipelineConfig, RETRY_BACKOFF};
pub use coordinator::WriteCoordinator;
pub use error::{PipelineError, PipelineResult};
pub use monitor::{Monitor, MonitorSnapshot, RejectionEvent};
pub use pool::WorkerPool;
pub use stats::{PipelineMetrics, WriterStats, WriterStatsSnapshot};
pub use writer::{
    AsyncWriter, BulkWriter, FlushHandle, FlushResult, PartitionLocator, SyncWriter, Writer,
};
