//! The buffer: an append-only staging area in front of the database.
//!
//! Inserts are a single sequential append, which keeps write latency flat.
//! Every buffered write is at least as recent as anything in the database,
//! so readers overlay the buffer on top of database state. Background
//! transport drains the oldest entries into the database and records a
//! transport marker; once nothing is pending the log is truncated.

mod record;

pub use record::BufferedWrite;

use crate::error::{CoreError, CoreResult};
use crate::log::{FrameIterator, FramedLog, LogFormat};
use crate::types::RecordId;
use crate::value::Value;
use crate::write::{Action, Revision, Write};
use parking_lot::{Mutex, RwLock};
use record::BufferRecord;
use std::collections::{BTreeSet, VecDeque};
use versadb_storage::StorageBackend;

/// The staging tier.
pub struct Buffer {
    log: Mutex<FramedLog>,
    pending: RwLock<VecDeque<BufferedWrite>>,
    next_seq: Mutex<u64>,
}

impl Buffer {
    /// Opens a buffer over `backend`, replaying whatever it holds.
    ///
    /// Writes at or below the highest transport marker already reached the
    /// database and are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupt or cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>, sync_on_insert: bool) -> CoreResult<Self> {
        let mut log = FramedLog::new(LogFormat::BUFFER, backend, sync_on_insert);
        let mut staged = Vec::new();
        let mut through = 0u64;

        let summary = log.replay(|frame| {
            match BufferRecord::from_frame(frame)? {
                BufferRecord::Staged(entry) => staged.push(entry),
                BufferRecord::Transported { through: t } => through = through.max(t),
            }
            Ok(())
        })?;

        let last_seq = staged.iter().map(|e| e.seq).max().unwrap_or(0).max(through);
        let pending: VecDeque<BufferedWrite> =
            staged.into_iter().filter(|e| e.seq > through).collect();

        if pending.is_empty() && log.size()? > 0 {
            log.reset()?;
        }
        if summary.frames > 0 {
            tracing::info!(
                frames = summary.frames,
                pending = pending.len(),
                "recovered buffer"
            );
        }

        Ok(Self {
            log: Mutex::new(log),
            pending: RwLock::new(pending),
            next_seq: Mutex::new(last_seq + 1),
        })
    }

    /// Appends a stamped, storable write and makes it visible to reads.
    ///
    /// Returns the write's sequence number.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotForStorage`] or [`CoreError::Unstamped`] on
    /// a write that does not belong in storage, or with an I/O error.
    pub fn insert(&self, write: Write) -> CoreResult<u64> {
        if !write.is_storable() {
            return Err(CoreError::not_for_storage(write));
        }
        if !write.version().is_stamped() {
            return Err(CoreError::unstamped(write));
        }

        let mut log = self.log.lock();
        let mut next_seq = self.next_seq.lock();
        let entry = BufferedWrite {
            seq: *next_seq,
            write,
        };
        log.append(BufferRecord::STAGED, &entry)?;
        *next_seq += 1;

        let seq = entry.seq;
        self.pending.write().push_back(entry);
        Ok(seq)
    }

    /// Applies buffered changes to `(key, record)` on top of `values`.
    pub fn overlay(&self, key: &str, record: RecordId, values: &mut Vec<Value>) {
        for entry in self.pending.read().iter() {
            let write = &entry.write;
            if write.record() != record || write.key() != key {
                continue;
            }
            match write.kind().action() {
                Some(Action::Add) => {
                    if !values.contains(write.value()) {
                        values.push(write.value().clone());
                    }
                }
                Some(Action::Remove) => values.retain(|v| v != write.value()),
                None => {}
            }
        }
    }

    /// Returns whether `value` is present after replaying buffered changes
    /// on top of `base`.
    #[must_use]
    pub fn toggles(&self, key: &str, value: &Value, record: RecordId, base: bool) -> bool {
        self.pending
            .read()
            .iter()
            .filter(|e| e.write.matches(key, value, record))
            .fold(base, |present, e| match e.write.kind().action() {
                Some(Action::Add) => true,
                Some(Action::Remove) => false,
                None => present,
            })
    }

    /// Buffered revisions of `(key, record)`, oldest first.
    #[must_use]
    pub fn history(&self, key: &str, record: RecordId) -> Vec<Revision> {
        self.pending
            .read()
            .iter()
            .filter(|e| e.write.record() == record && e.write.key() == key)
            .filter_map(|e| e.write.to_revision())
            .collect()
    }

    /// Keys with buffered changes in `record`.
    #[must_use]
    pub fn keys_in(&self, record: RecordId) -> BTreeSet<String> {
        self.pending
            .read()
            .iter()
            .filter(|e| e.write.record() == record)
            .map(|e| e.write.key().to_string())
            .collect()
    }

    /// The `n` oldest pending writes, in insertion order.
    #[must_use]
    pub fn oldest(&self, n: usize) -> Vec<BufferedWrite> {
        self.pending.read().iter().take(n).cloned().collect()
    }

    /// Records that every write up to `through` reached the database and
    /// releases them. Truncates the log once nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn mark_transported(&self, through: u64) -> CoreResult<()> {
        let mut log = self.log.lock();
        let mut pending = self.pending.write();

        if pending.is_empty() || pending.front().is_some_and(|e| e.seq > through) {
            return Ok(());
        }

        log.append(BufferRecord::TRANSPORTED, &through)?;
        while pending.front().is_some_and(|e| e.seq <= through) {
            pending.pop_front();
        }

        if pending.is_empty() {
            log.sync()?;
            log.reset()?;
        }
        Ok(())
    }

    /// Number of pending writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    /// Size of the staging log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn log_size(&self) -> CoreResult<u64> {
        self.log.lock().size()
    }

    /// Makes every staged write durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.log.lock().sync()
    }
}

/// What a read-only pass over a buffer log found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferScan {
    /// Complete frames read.
    pub frames: usize,
    /// Writes staged but not yet transported, oldest first.
    pub pending: Vec<BufferedWrite>,
    /// Highest sequence marked as transported.
    pub transported_through: u64,
    /// Whether the log ends in an incomplete frame.
    pub torn_tail: bool,
}

impl Buffer {
    /// Reads a buffer log without opening it. Nothing is truncated.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupt or cannot be read.
    pub fn scan(backend: &dyn StorageBackend) -> CoreResult<BufferScan> {
        let mut iter = FrameIterator::new(backend, LogFormat::BUFFER)?;
        let mut scan = BufferScan::default();
        let mut staged = Vec::new();
        for frame in iter.by_ref() {
            match BufferRecord::from_frame(&frame?)? {
                BufferRecord::Staged(entry) => staged.push(entry),
                BufferRecord::Transported { through } => {
                    scan.transported_through = scan.transported_through.max(through);
                }
            }
            scan.frames += 1;
        }
        scan.torn_tail = iter.torn_tail();
        scan.pending = staged
            .into_iter()
            .filter(|e| e.seq > scan.transported_through)
            .collect();
        Ok(scan)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;
    use versadb_storage::{InMemoryBackend, SharedMemoryBackend};

    fn buffer() -> Buffer {
        Buffer::open(Box::new(InMemoryBackend::new()), false).unwrap()
    }

    fn add(key: &str, value: &str, record: u64, version: u64) -> Write {
        Write::add(key, value, RecordId::new(record)).stamped(Version::new(version))
    }

    fn remove(key: &str, value: &str, record: u64, version: u64) -> Write {
        Write::remove(key, value, RecordId::new(record)).stamped(Version::new(version))
    }

    #[test]
    fn insert_rejects_unstorable_writes() {
        let buffer = buffer();
        let transient = Write::not_for_storage("name", "Bob", RecordId::new(1)).stamped(Version::new(1));
        assert!(matches!(
            buffer.insert(transient),
            Err(CoreError::NotForStorage { .. })
        ));
        assert!(matches!(
            buffer.insert(Write::add("name", "Bob", RecordId::new(1))),
            Err(CoreError::Unstamped { .. })
        ));
        assert!(buffer.is_empty());
        assert_eq!(buffer.log_size().unwrap(), 0);
    }

    #[test]
    fn sequences_follow_insertion_order() {
        let buffer = buffer();
        assert_eq!(buffer.insert(add("a", "1", 1, 10)).unwrap(), 1);
        assert_eq!(buffer.insert(add("b", "2", 1, 11)).unwrap(), 2);
        assert_eq!(buffer.insert(add("a", "3", 2, 12)).unwrap(), 3);

        let oldest = buffer.oldest(2);
        assert_eq!(oldest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(oldest[1].write.key(), "b");
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn overlay_applies_changes_in_order() {
        let buffer = buffer();
        buffer.insert(add("name", "Bob", 42, 1)).unwrap();
        buffer.insert(add("name", "Ann", 42, 2)).unwrap();
        buffer.insert(remove("name", "Joe", 42, 3)).unwrap();
        buffer.insert(remove("name", "Bob", 42, 4)).unwrap();
        buffer.insert(add("name", "Zed", 7, 5)).unwrap();

        let mut values = vec![Value::from("Joe"), Value::from("Kim")];
        buffer.overlay("name", RecordId::new(42), &mut values);
        assert_eq!(values, vec![Value::from("Kim"), Value::from("Ann")]);
    }

    #[test]
    fn toggles_tracks_presence() {
        let buffer = buffer();
        let bob = Value::from("Bob");
        let record = RecordId::new(42);
        assert!(!buffer.toggles("name", &bob, record, false));
        assert!(buffer.toggles("name", &bob, record, true));

        buffer.insert(add("name", "Bob", 42, 1)).unwrap();
        assert!(buffer.toggles("name", &bob, record, false));

        buffer.insert(remove("name", "Bob", 42, 2)).unwrap();
        assert!(!buffer.toggles("name", &bob, record, true));
    }

    #[test]
    fn history_and_keys() {
        let buffer = buffer();
        buffer.insert(add("name", "Bob", 42, 1)).unwrap();
        buffer.insert(add("age", "30", 42, 2)).unwrap();
        buffer.insert(remove("name", "Bob", 42, 3)).unwrap();

        let history = buffer.history("name", RecordId::new(42));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, Action::Add);
        assert_eq!(history[1].version, Version::new(3));

        let keys: Vec<String> = buffer.keys_in(RecordId::new(42)).into_iter().collect();
        assert_eq!(keys, vec!["age".to_string(), "name".to_string()]);
        assert!(buffer.keys_in(RecordId::new(1)).is_empty());
    }

    #[test]
    fn transport_releases_and_truncates() {
        let buffer = buffer();
        buffer.insert(add("a", "1", 1, 1)).unwrap();
        buffer.insert(add("a", "2", 1, 2)).unwrap();
        buffer.insert(add("a", "3", 1, 3)).unwrap();

        buffer.mark_transported(2).unwrap();
        assert_eq!(buffer.len(), 1);
        assert!(buffer.log_size().unwrap() > 0);

        buffer.mark_transported(3).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.log_size().unwrap(), 0);

        assert_eq!(buffer.insert(add("a", "4", 1, 4)).unwrap(), 4);
    }

    #[test]
    fn recovery_skips_transported_writes() {
        let disk = SharedMemoryBackend::new();
        {
            let buffer = Buffer::open(Box::new(disk.clone()), true).unwrap();
            buffer.insert(add("a", "1", 1, 1)).unwrap();
            buffer.insert(add("a", "2", 1, 2)).unwrap();
            buffer.insert(add("a", "3", 1, 3)).unwrap();
            buffer.mark_transported(1).unwrap();
        }

        let buffer = Buffer::open(Box::new(disk.clone()), true).unwrap();
        let seqs: Vec<u64> = buffer.oldest(10).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(buffer.insert(add("a", "4", 1, 4)).unwrap(), 4);
    }

    #[test]
    fn recovery_of_fully_transported_log_resets_it() {
        let disk = SharedMemoryBackend::new();
        {
            let buffer = Buffer::open(Box::new(disk.clone()), false).unwrap();
            buffer.insert(add("a", "1", 1, 1)).unwrap();
        }
        // Marker written but the truncate never happened.
        {
            let mut log = FramedLog::new(LogFormat::BUFFER, Box::new(disk.clone()), false);
            log.append(BufferRecord::TRANSPORTED, &1u64).unwrap();
        }

        let buffer = Buffer::open(Box::new(disk.clone()), false).unwrap();
        assert!(buffer.is_empty());
        assert!(disk.data().is_empty());
    }

    #[test]
    fn recovery_tolerates_torn_tail() {
        let disk = SharedMemoryBackend::new();
        {
            let buffer = Buffer::open(Box::new(disk.clone()), true).unwrap();
            buffer.insert(add("a", "1", 1, 1)).unwrap();
            buffer.insert(add("a", "2", 1, 2)).unwrap();
        }
        let mut bytes = disk.data();
        bytes.truncate(bytes.len() - 5);
        disk.replace(bytes);

        let buffer = Buffer::open(Box::new(disk.clone()), true).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.oldest(1)[0].write.value(), &Value::from("1"));
    }

    #[test]
    fn recovery_rejects_corruption() {
        let disk = SharedMemoryBackend::new();
        {
            let buffer = Buffer::open(Box::new(disk.clone()), true).unwrap();
            buffer.insert(add("a", "1", 1, 1)).unwrap();
        }
        let mut bytes = disk.data();
        bytes[14] ^= 0xff;
        disk.replace(bytes);

        assert!(matches!(
            Buffer::open(Box::new(disk), true),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn scan_reads_without_truncating() {
        let disk = SharedMemoryBackend::new();
        {
            let buffer = Buffer::open(Box::new(disk.clone()), false).unwrap();
            buffer.insert(add("a", "1", 1, 10)).unwrap();
            buffer.insert(add("b", "2", 1, 11)).unwrap();
            buffer.insert(add("c", "3", 1, 12)).unwrap();
            buffer.mark_transported(1).unwrap();
            buffer.insert(add("d", "4", 1, 13)).unwrap();
        }
        let mut bytes = disk.data();
        bytes.truncate(bytes.len() - 2);
        disk.replace(bytes);
        let size = disk.data().len();

        let scan = Buffer::scan(&disk).unwrap();
        assert_eq!(scan.frames, 4);
        assert_eq!(scan.transported_through, 1);
        assert!(scan.torn_tail);
        assert_eq!(
            scan.pending.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(disk.data().len(), size);
    }
}
