//! # VersaDB Storage
//!
//! Byte-level storage backends underneath VersaDB's append-only logs.
//!
//! A backend knows nothing about what it stores. The buffer log, the
//! revision log and transaction backups all frame their own records on top
//! of the same three primitives: append, read back, and make durable.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - private bytes, gone when dropped
//! - [`SharedMemoryBackend`] - cloneable handle over shared bytes, so a test
//!   can drop an engine and reopen it on the "same disk"
//! - [`FileBackend`] - a single file accessed through OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use versadb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"staged").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"staged");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::{InMemoryBackend, SharedMemoryBackend};
