//! Memory-resident backends.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

fn read_range(data: &[u8], offset: u64, len: usize) -> StorageResult<Vec<u8>> {
    let size = data.len() as u64;
    let end = offset.saturating_add(len as u64);
    if offset > size || end > size {
        return Err(StorageError::ReadPastEnd { offset, len, size });
    }
    Ok(data[offset as usize..end as usize].to_vec())
}

fn truncate_vec(data: &mut Vec<u8>, new_size: u64) -> StorageResult<()> {
    let size = data.len() as u64;
    if new_size > size {
        return Err(StorageError::TruncateBeyondEnd {
            requested: new_size,
            size,
        });
    }
    data.truncate(new_size as usize);
    Ok(())
}

/// A private in-memory backend.
///
/// Used for ephemeral engines and unit tests. Everything is lost on drop.
///
/// ```rust
/// use versadb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.append(b"abc").unwrap();
/// assert_eq!(backend.size().unwrap(), 3);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`, e.g. a hand-crafted log.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        read_range(&self.data.read(), offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        truncate_vec(&mut self.data.write(), new_size)
    }
}

/// An in-memory backend whose clones all see the same bytes.
///
/// Dropping an engine and reopening it with a clone of the same handle is
/// the in-memory equivalent of a process restart over the same files.
///
/// ```rust
/// use versadb_storage::{StorageBackend, SharedMemoryBackend};
///
/// let disk = SharedMemoryBackend::new();
/// let mut writer = disk.clone();
/// writer.append(b"survives").unwrap();
/// drop(writer);
/// assert_eq!(disk.size().unwrap(), 8);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl SharedMemoryBackend {
    /// Creates an empty shared backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Replaces the stored bytes, e.g. to simulate a torn write.
    pub fn replace(&self, bytes: Vec<u8>) {
        *self.data.write() = bytes;
    }
}

impl StorageBackend for SharedMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        read_range(&self.data.read(), offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        truncate_vec(&mut self.data.write(), new_size)
    }
}
