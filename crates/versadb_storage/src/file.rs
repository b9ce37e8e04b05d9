//! Single-file backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A backend stored in one file.
///
/// `flush` hands bytes to the OS; `sync` calls `sync_all` so they survive a
/// power loss. The logical size is tracked in memory to avoid a metadata
/// call per read.
///
/// ```no_run
/// use versadb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("buffer.log")).unwrap();
/// backend.append(b"frame").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens `path` for reading and appending, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(FileState { file, size }),
        })
    }

    /// Like [`Self::open`], creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.state.lock();
        let size = state.size;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; len];
        state.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = self.state.get_mut();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(data)?;
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.state.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.get_mut().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let state = self.state.get_mut();
        if new_size > state.size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: state.size,
            });
        }

        state.file.set_len(new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("log")).unwrap();

        assert_eq!(backend.append(b"stage").unwrap(), 0);
        assert_eq!(backend.append(b"d").unwrap(), 5);
        assert_eq!(backend.append(b"").unwrap(), 6);

        assert_eq!(backend.read_at(0, 6).unwrap(), b"staged");
        assert_eq!(backend.read_from(2).unwrap(), b"aged");
        assert!(matches!(
            backend.read_at(4, 4),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("database.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"revision").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 8);
        assert_eq!(backend.read_from(0).unwrap(), b"revision");
    }

    #[test]
    fn truncate_then_append_overwrites_tail() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("log")).unwrap();

        backend.append(b"keep-drop").unwrap();
        backend.truncate(4).unwrap();
        backend.append(b"!").unwrap();

        assert_eq!(backend.read_from(0).unwrap(), b"keep!");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::TruncateBeyondEnd { .. })
        ));
    }

    #[test]
    fn nested_directories_are_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txn").join("deep").join("1.bak");

        let mut backend = FileBackend::open_with_create_dirs(&path).unwrap();
        backend.append(b"x").unwrap();
        backend.flush().unwrap();
        backend.sync().unwrap();
        assert!(path.exists());
    }
}
