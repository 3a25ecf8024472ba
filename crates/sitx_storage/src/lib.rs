//! # sitx storage
//!
//! The lowest layer of sitx. Nothing in this crate knows about transactions:
//!
//! - [`StorageBackend`] is an opaque append-only byte store. The transaction
//!   store writes its log through it.
//! - [`KvPair`] is the row mutation unit handed from the execution layer to the
//!   write pipeline, and back out of the read path.
//! - [`VersionedStore`] keeps every version of every row of one partition,
//!   newest first. Deciding which version a reader sees happens above this
//!   crate; here a version is just a timestamp, a writer id and a value.
//!
//! ## Example
//!
//! ```rust
//! use sitx_storage::{Cell, ReadOptions, VersionedStore};
//!
//! let store = VersionedStore::new();
//! store.put(b"row-1".as_slice().into(), Cell::put(10, 10, b"v1".as_slice().into()));
//! store.put(b"row-1".as_slice().into(), Cell::put(20, 20, b"v2".as_slice().into()));
//!
//! let latest = store.get(b"row-1", &ReadOptions::default());
//! assert_eq!(latest.len(), 1);
//! assert_eq!(latest[0].timestamp, 20);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod kv;
mod memory;
mod versioned;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use kv::{KvPair, MutationKind};
pub use memory::InMemoryBackend;
pub use versioned::{Cell, CellValue, ReadOptions, VersionedStore};
