//! # sitx core
//!
//! Snapshot-isolation transactions over the versioned cells of
//! [`sitx_storage`].
//!
//! This crate provides:
//! - [`TxnStore`] and [`PartitionedTxnStore`], the durable record of every
//!   transaction's state and timestamps
//! - [`TxnChain`] and [`WriterFate`], which decide whether one transaction's
//!   write is visible to, or conflicts with, another
//! - [`TxnFilter`], [`PackedTxnFilter`] and [`ReadController`] for the read path
//! - [`TxnRegion`], which validates and applies write batches for one partition
//! - [`TxnResolver`] and the [`ReadResolver`]s that clean up lazily
//! - [`OperationStatus`], the per-row outcome handed back to writers
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use sitx_core::{Timestamp, TransactionStore, TxnConfig, TxnId, TxnRegion, TxnStore, TxnView};
//! use sitx_storage::{KvPair, VersionedStore};
//!
//! let txns: Arc<dyn TransactionStore> = Arc::new(TxnStore::in_memory(TxnConfig::default()));
//! let region = TxnRegion::new("r0", Bytes::new(), None, Arc::new(VersionedStore::new()), Arc::clone(&txns));
//!
//! let txn = TxnView::new(TxnId(1), Timestamp(1));
//! txns.record_transaction(&txn).unwrap();
//! let statuses = region.apply_batch(&txn, &[KvPair::upsert(Bytes::from_static(b"k"), Bytes::from_static(b"v"))]);
//! assert!(statuses[0].is_success());
//! txns.record_commit(TxnId(1), Timestamp(2)).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod filter;
mod region;
mod resolver;
mod stats;
mod status;
mod txn;
mod types;

pub use clock::{Clock, ManualClock, MonotonicTimestampSource, SystemClock, TimestampSource};
pub use config::TxnConfig;
pub use error::{CoreError, CoreResult};
pub use filter::{
    encode_packed_row, AsyncReadResolver, ColumnMask, NoopReadResolver, PackedRow,
    PackedTxnFilter, ReadController, ReadResolver, SynchronousReadResolver, TxnFilter,
};
pub use region::TxnRegion;
pub use resolver::{Resolution, ResolveKind, ResolverStatsSnapshot, TxnResolver};
pub use stats::{TxnStats, TxnStatsSnapshot};
pub use status::{
    get_correct_status, ErrorClass, Failure, FailureKind, OperationStatus,
    ADDITIVE_WRITE_CONFLICT,
};
pub use txn::{
    compute_crc32, PartitionedTxnStore, TransactionStore, TxnChain, TxnLog, TxnLogRecord,
    TxnLogRecordType, TxnStore, TxnView, WriterFate, LOG_MAGIC, LOG_VERSION,
};
pub use types::{IsolationLevel, Timestamp, TxnId, TxnState};
