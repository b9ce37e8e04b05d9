//! The storage backend trait.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// Backends hold opaque bytes. Framing, checksums and record meaning belong
/// to the log that sits on top of them.
///
/// # Invariants
///
/// - `append` returns the offset at which the bytes landed, which is the
///   size of the backend before the call
/// - `read_at` returns exactly the bytes previously appended at that range
/// - after `sync` returns, every appended byte survives process termination
/// - `truncate` only ever shrinks
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] when the range is not
    /// fully inside the backend, or with an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes could not be written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered bytes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the offset of the next append).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all appended bytes and metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Shrinks the backend to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::TruncateBeyondEnd`] when `new_size`
    /// is larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads everything from `offset` to the end.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::size`] and [`Self::read_at`].
    fn read_from(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        if offset >= size {
            return Ok(Vec::new());
        }
        self.read_at(offset, (size - offset) as usize)
    }
}
