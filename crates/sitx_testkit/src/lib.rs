//! # sitx testkit
//!
//! Test utilities for sitx.
//!
//! This crate provides:
//! - Fixtures: a transaction harness, an in-memory cluster of regions that
//!   plugs into the write pipeline, and a fault-injecting transport
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use sitx_testkit::prelude::*;
//!
//! let cluster = Cluster::new(&[b"m"]);
//! let txn = cluster.harness().begin();
//! assert_eq!(cluster.region_names(), vec!["region-0", "region-1"]);
//! cluster.harness().commit(&txn);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
