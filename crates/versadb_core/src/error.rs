//! Error types for VersaDB core.

use crate::write::Write;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in VersaDB core operations.
///
/// A write rejected because it was already applied is *not* an error; the
/// acceptance path reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] versadb_storage::StorageError),

    /// I/O error outside a storage backend (directories, lock files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log payload could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A log is structurally damaged.
    #[error("{log} log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Which log was being read.
        log: &'static str,
        /// Offset of the damaged frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A frame checksum did not match its contents.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A `NotForStorage` write was submitted for storage. This is a caller bug.
    #[error("write is not for storage: {write}")]
    NotForStorage {
        /// The offending write.
        write: Box<Write>,
    },

    /// A write reached a storage tier without a version stamp.
    #[error("write has no version stamp: {write}")]
    Unstamped {
        /// The offending write.
        write: Box<Write>,
    },

    /// The engine is draining or terminated and refuses new work.
    #[error("engine is not serving (state: {state})")]
    EngineNotServing {
        /// The engine state at the time of the call.
        state: &'static str,
    },

    /// The durable store was shut down.
    #[error("store is closed")]
    StoreClosed,

    /// The transaction already committed or aborted.
    #[error("transaction {txid} is not active ({state})")]
    TransactionNotActive {
        /// Transaction identifier.
        txid: u64,
        /// The state it is in.
        state: &'static str,
    },

    /// The task scheduler no longer accepts work.
    #[error("task scheduler is shut down")]
    SchedulerShutdown,

    /// Another process holds the engine directory.
    #[error("engine directory locked: another process has exclusive access")]
    EngineLocked,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(log: &'static str, offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            log,
            offset,
            message: message.into(),
        }
    }

    /// Creates a not-for-storage precondition error.
    pub fn not_for_storage(write: Write) -> Self {
        Self::NotForStorage {
            write: Box::new(write),
        }
    }

    /// Creates an unstamped-write error.
    pub fn unstamped(write: Write) -> Self {
        Self::Unstamped {
            write: Box::new(write),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns `true` for caller bugs (as opposed to runtime faults).
    #[must_use]
    pub fn is_precondition_violation(&self) -> bool {
        matches!(self, Self::NotForStorage { .. } | Self::Unstamped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordId;
    use crate::value::Value;

    #[test]
    fn precondition_errors_are_classified() {
        let write = Write::not_for_storage("name", Value::from("Bob"), RecordId::new(42));
        let err = CoreError::not_for_storage(write);
        assert!(err.is_precondition_violation());
        assert!(err.to_string().contains("not for storage"));

        assert!(!CoreError::StoreClosed.is_precondition_violation());
    }

    #[test]
    fn corruption_message_names_the_log() {
        let err = CoreError::log_corruption("buffer", 128, "bad magic");
        assert_eq!(
            err.to_string(),
            "buffer log corruption at offset 128: bad magic"
        );
    }
}
