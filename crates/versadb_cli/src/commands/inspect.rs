//! Inspect and dump-buffer command implementations.
//!
//! Both read the logs directly instead of opening an engine, so nothing is
//! recovered, replayed or truncated. The directory lock is still taken so a
//! running engine is not read mid-append.

use super::{print_json, CliError, Format};
use serde::Serialize;
use std::path::Path;
use versadb_core::{Backup, Buffer, BufferedWrite, Database, EngineDir};
use versadb_storage::{FileBackend, StorageBackend};

/// Engine inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Engine path.
    pub path: String,
    /// Buffer log size in bytes.
    pub buffer_size: u64,
    /// Frames in the buffer log.
    pub buffer_frames: usize,
    /// Writes waiting to be transported.
    pub pending_writes: usize,
    /// Whether the buffer log ends in a torn frame.
    pub buffer_torn_tail: bool,
    /// Revision log size in bytes.
    pub database_size: u64,
    /// Revisions in the database.
    pub revisions: usize,
    /// Fields ever written.
    pub fields: usize,
    /// Fields currently holding values.
    pub live_fields: usize,
    /// Records ever written.
    pub records: usize,
    /// Highest version in the database.
    pub latest_version: u64,
    /// Whether the revision log ends in a torn frame.
    pub database_torn_tail: bool,
    /// Transaction backups that the next open will replay or discard.
    pub backups: Vec<BackupInfo>,
}

/// A transaction backup left on disk.
#[derive(Debug, Serialize)]
pub struct BackupInfo {
    /// Transaction identifier.
    pub txid: u64,
    /// Whether the backup was sealed (and will be replayed).
    pub sealed: bool,
    /// Writes in a sealed backup.
    pub writes: usize,
}

fn open_dir(path: &Path) -> Result<EngineDir, CliError> {
    if !path.is_dir() {
        return Err(CliError::NoEngine(path.display().to_string()));
    }
    let dir = EngineDir::open(path, false)?;
    if !dir.buffer_path().exists() && !dir.database_path().exists() {
        return Err(CliError::NoEngine(path.display().to_string()));
    }
    Ok(dir)
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<InspectResult, CliError> {
    let dir = open_dir(path)?;
    let buffer = FileBackend::open(&dir.buffer_path())?;
    let database = FileBackend::open(&dir.database_path())?;
    let buffer_scan = Buffer::scan(&buffer)?;
    let database_scan = Database::scan(&database)?;

    let mut backups = Vec::new();
    for (txid, backup_path) in dir.list_backups()? {
        let writes = Backup::read(&backup_path)?;
        backups.push(BackupInfo {
            txid: txid.as_u64(),
            sealed: writes.is_some(),
            writes: writes.map_or(0, |w| w.len()),
        });
    }

    let result = InspectResult {
        path: path.display().to_string(),
        buffer_size: buffer.size()?,
        buffer_frames: buffer_scan.frames,
        pending_writes: buffer_scan.pending.len(),
        buffer_torn_tail: buffer_scan.torn_tail,
        database_size: database.size()?,
        revisions: database_scan.revisions,
        fields: database_scan.fields,
        live_fields: database_scan.live_fields,
        records: database_scan.records,
        latest_version: database_scan.latest.as_u64(),
        database_torn_tail: database_scan.torn_tail,
        backups,
    };

    match format {
        Format::Json => print_json(&result)?,
        Format::Text => print_text_output(&result),
    }
    Ok(result)
}

/// Prints the writes waiting in the buffer, oldest first.
pub fn dump_buffer(
    path: &Path,
    limit: Option<usize>,
    format: Format,
) -> Result<Vec<BufferedWrite>, CliError> {
    let dir = open_dir(path)?;
    let buffer = FileBackend::open(&dir.buffer_path())?;
    let mut pending = Buffer::scan(&buffer)?.pending;
    if let Some(limit) = limit {
        pending.truncate(limit);
    }

    match format {
        Format::Json => print_json(&pending)?,
        Format::Text => {
            for entry in &pending {
                println!("#{:<6} {}", entry.seq, entry.write);
            }
        }
    }
    Ok(pending)
}

fn print_text_output(result: &InspectResult) {
    println!("VersaDB Engine Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Buffer:");
    println!("  Size:           {}", format_size(result.buffer_size));
    println!("  Frames:         {}", result.buffer_frames);
    println!("  Pending writes: {}", result.pending_writes);
    if result.buffer_torn_tail {
        println!("  Torn tail:      yes (cut off on next open)");
    }
    println!();
    println!("Database:");
    println!("  Size:           {}", format_size(result.database_size));
    println!("  Revisions:      {}", result.revisions);
    println!("  Records:        {}", result.records);
    println!(
        "  Fields:         {} ({} live)",
        result.fields, result.live_fields
    );
    println!("  Latest version: v{}", result.latest_version);
    if result.database_torn_tail {
        println!("  Torn tail:      yes (cut off on next open)");
    }

    if !result.backups.is_empty() {
        println!();
        println!("Transaction backups:");
        for backup in &result.backups {
            if backup.sealed {
                println!("  [txn:{}] sealed, {} writes", backup.txid, backup.writes);
            } else {
                println!("  [txn:{}] unsealed, will be discarded", backup.txid);
            }
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
