//! Commit backups.
//!
//! Before a transaction's writes enter the pipeline they are written to a
//! backup file and sealed. If the process dies mid-commit, the next open
//! finds the sealed backup and replays it; writes that already made it in
//! are rejected as duplicates, the rest are applied. A backup without a
//! seal was never acted on and is discarded.

use crate::error::{CoreError, CoreResult};
use crate::log::{FramedLog, LogFormat};
use crate::types::TransactionId;
use crate::write::Write;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use versadb_storage::FileBackend;

const WRITE: u8 = 1;
const SEAL: u8 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Seal {
    txid: u64,
    writes: u64,
}

/// A sealed backup on disk.
#[derive(Debug)]
pub struct Backup {
    path: PathBuf,
}

impl Backup {
    /// Writes `writes` to `path`, seals and syncs it.
    ///
    /// An existing file at `path` is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or synced.
    pub fn write(path: &Path, txid: TransactionId, writes: &[Write]) -> CoreResult<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        let backend = FileBackend::open_with_create_dirs(path)?;
        let mut log = FramedLog::new(LogFormat::BACKUP, Box::new(backend), false);
        for write in writes {
            log.append(WRITE, write)?;
        }
        log.append(
            SEAL,
            &Seal {
                txid: txid.as_u64(),
                writes: writes.len() as u64,
            },
        )?;
        log.sync()?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Reads the backup at `path`.
    ///
    /// Returns `None` if it was never sealed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is corrupt, or sealed with a count that
    /// does not match its contents.
    pub fn read(path: &Path) -> CoreResult<Option<Vec<Write>>> {
        let backend = FileBackend::open(path)?;
        let log = FramedLog::new(LogFormat::BACKUP, Box::new(backend), false);

        let mut writes = Vec::new();
        let mut seal: Option<Seal> = None;
        for frame in log.frames()? {
            let frame = frame?;
            if seal.is_some() {
                return Err(CoreError::log_corruption(
                    "backup",
                    frame.offset,
                    "frame after seal",
                ));
            }
            match frame.kind {
                WRITE => writes.push(frame.decode::<Write>()?),
                SEAL => seal = Some(frame.decode()?),
                other => {
                    return Err(CoreError::log_corruption(
                        "backup",
                        frame.offset,
                        format!("unknown record kind {other}"),
                    ))
                }
            }
        }

        match seal {
            None => Ok(None),
            Some(seal) if seal.writes != writes.len() as u64 => Err(CoreError::log_corruption(
                "backup",
                0,
                format!(
                    "seal of txn {} counts {} writes, found {}",
                    seal.txid,
                    seal.writes,
                    writes.len()
                ),
            )),
            Some(_) => Ok(Some(writes)),
        }
    }

    /// Path of the backup file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the backup once its writes are all in the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub fn discard(self) -> CoreResult<()> {
        discard(&self.path)
    }
}

/// Deletes the backup at `path` if present.
pub(crate) fn discard(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
