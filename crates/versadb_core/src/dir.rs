//! Engine directory management.
//!
//! ```text
//! <engine_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ buffer.log        # Staged writes not yet transported
//! ├─ database.log      # Revision log behind the database index
//! └─ txn/              # One backup per committing transaction
//!    └─ <id>.bak
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const BUFFER_FILE: &str = "buffer.log";
const DATABASE_FILE: &str = "database.log";
const TXN_DIR: &str = "txn";
const BACKUP_EXTENSION: &str = "bak";

/// Holds the engine directory and its exclusive lock.
///
/// Only one `EngineDir` can exist per directory at a time, across
/// processes. The lock is released when the value is dropped.
#[derive(Debug)]
pub struct EngineDir {
    path: PathBuf,
    _lock_file: File,
}

impl EngineDir {
    /// Opens or creates an engine directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the directory doesn't exist and `create_if_missing` is false
    /// - another process holds the lock ([`CoreError::EngineLocked`])
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "engine directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::EngineLocked);
        }

        fs::create_dir_all(path.join(TXN_DIR))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the buffer log.
    #[must_use]
    pub fn buffer_path(&self) -> PathBuf {
        self.path.join(BUFFER_FILE)
    }

    /// Path of the revision log.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.path.join(DATABASE_FILE)
    }

    /// Directory holding transaction backups.
    #[must_use]
    pub fn txn_dir(&self) -> PathBuf {
        self.path.join(TXN_DIR)
    }

    /// Path of the backup for `txid`.
    #[must_use]
    pub fn backup_path(&self, txid: TransactionId) -> PathBuf {
        self.txn_dir()
            .join(format!("{}.{BACKUP_EXTENSION}", txid.as_u64()))
    }

    /// Lists backups left behind, ordered by transaction id.
    ///
    /// Files that do not look like backups are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_backups(&self) -> CoreResult<Vec<(TransactionId, PathBuf)>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(self.txn_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            backups.push((TransactionId::new(id), path));
        }
        backups.sort_by_key(|(id, _)| *id);
        Ok(backups)
    }

    /// Fsyncs the transaction directory so backup creation and removal are
    /// durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened or synced.
    #[cfg(unix)]
    pub fn sync_txn_dir(&self) -> CoreResult<()> {
        File::open(self.txn_dir())?.sync_all()?;
        Ok(())
    }

    /// No-op where directories cannot be fsynced.
    ///
    /// # Errors
    ///
    /// Never fails.
    #[cfg(not(unix))]
    pub fn sync_txn_dir(&self) -> CoreResult<()> {
        Ok(())
    }
}
