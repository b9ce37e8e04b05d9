//! Storage error types.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system reported an I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes the backend does not have.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Size of the backend at the time of the read.
        size: u64,
    },

    /// A truncate asked to grow the backend.
    #[error("cannot truncate to {requested} bytes, backend holds {size}")]
    TruncateBeyondEnd {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// The backend refused the operation because it was closed or failed.
    #[error("storage is closed")]
    Closed,
}
