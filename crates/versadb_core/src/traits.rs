//! Capabilities the engine exposes to the rest of the system.

use crate::error::CoreResult;
use crate::transaction::Transaction;
use crate::write::Write;

/// Something that takes writes for storage.
pub trait Destination {
    /// Accepts `write` into storage.
    ///
    /// Returns `false` if the write was already applied.
    ///
    /// # Errors
    ///
    /// Fails on precondition violations, when not serving, or on I/O error.
    fn accept(&self, write: Write) -> CoreResult<bool>;
}

/// Something that can run transactions.
pub trait Transactional {
    /// Starts a new transaction.
    ///
    /// # Errors
    ///
    /// Fails when not serving.
    fn start_transaction(&self) -> CoreResult<Transaction>;
}
