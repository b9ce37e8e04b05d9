//! # VersaDB Testkit
//!
//! Test utilities for VersaDB.
//!
//! This crate provides:
//! - Engine fixtures over memory, shared memory and temporary directories
//! - Property-based generators for writes and write sequences, plus a
//!   reference model to check them against
//! - Stress runners for concurrent accepts, transactions and shutdown
//! - Crash harnesses: torn logs, failing backends, leftover backups
//!
//! ## Usage
//!
//! ```rust
//! use versadb_testkit::prelude::*;
//! use versadb_core::RecordId;
//!
//! with_temp_engine(|engine| {
//!     assert!(engine.add("name", "Bob", RecordId::new(1)).unwrap());
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
