//! The buffering service: one façade over the buffer and the database.
//!
//! Writes always land in the buffer. Reads see the database with the buffer
//! overlaid on top, so transport is invisible to them. A single pipeline
//! lock orders the two: each accept and each transport batch holds it
//! exclusively, reads hold it shared. It is held for one operation at a
//! time, never across a transaction.

use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::types::{RecordId, Version};
use crate::value::Value;
use crate::write::{Action, Revision, Write};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exclusive hold on the write pipeline.
///
/// Obtained from [`BufferingService::write_lock`] and passed to the guarded
/// mutators. Released on drop.
#[must_use = "the pipeline is released as soon as the guard is dropped"]
pub struct PipelineGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl std::fmt::Debug for PipelineGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGuard").finish_non_exhaustive()
    }
}

/// Buffer and database behind a single pipeline.
pub struct BufferingService {
    buffer: Buffer,
    database: Database,
    pipeline: RwLock<()>,
    clock: Arc<Clock>,
    closed: AtomicBool,
}

impl BufferingService {
    /// Combines both tiers. New stamps come from `clock`.
    pub fn new(buffer: Buffer, database: Database, clock: Arc<Clock>) -> Self {
        for entry in buffer.oldest(usize::MAX) {
            clock.observe(entry.write.version());
        }
        clock.observe(database.latest_version());

        Self {
            buffer,
            database,
            pipeline: RwLock::new(()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Takes the pipeline exclusively.
    pub fn write_lock(&self) -> PipelineGuard<'_> {
        PipelineGuard {
            _guard: self.pipeline.write(),
        }
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.pipeline.read()
    }

    /// Adds `value` to `(key, record)` unless it is already present.
    ///
    /// # Errors
    ///
    /// See [`Self::add_guarded`].
    pub fn add(&self, key: &str, value: Value, record: RecordId) -> CoreResult<bool> {
        let guard = self.write_lock();
        self.add_guarded(&guard, key, value, record)
    }

    /// Removes `value` from `(key, record)` if it is present.
    ///
    /// # Errors
    ///
    /// See [`Self::remove_guarded`].
    pub fn remove(&self, key: &str, value: Value, record: RecordId) -> CoreResult<bool> {
        let guard = self.write_lock();
        self.remove_guarded(&guard, key, value, record)
    }

    /// [`Self::add`] for a caller already holding the pipeline.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StoreClosed`] after shutdown, or on I/O error.
    pub fn add_guarded(
        &self,
        guard: &PipelineGuard<'_>,
        key: &str,
        value: Value,
        record: RecordId,
    ) -> CoreResult<bool> {
        self.stage(guard, Action::Add, key, value, record, Version::UNSTAMPED)
    }

    /// [`Self::remove`] for a caller already holding the pipeline.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StoreClosed`] after shutdown, or on I/O error.
    pub fn remove_guarded(
        &self,
        guard: &PipelineGuard<'_>,
        key: &str,
        value: Value,
        record: RecordId,
    ) -> CoreResult<bool> {
        self.stage(guard, Action::Remove, key, value, record, Version::UNSTAMPED)
    }

    /// Applies `write` for a caller already holding the pipeline.
    ///
    /// An unstamped write is stamped now. A stamped write keeps its version
    /// and is rejected if that exact revision is already in the field's
    /// history, so replaying the same stamped writes twice never applies
    /// one twice, even when they add and remove the same value.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotForStorage`] for a write that must never
    /// be stored, or as [`Self::add_guarded`] does.
    pub fn apply_guarded(&self, guard: &PipelineGuard<'_>, write: &Write) -> CoreResult<bool> {
        let Some(action) = write.kind().action() else {
            return Err(CoreError::not_for_storage(write.clone()));
        };
        self.stage(
            guard,
            action,
            write.key(),
            write.value().clone(),
            write.record(),
            write.version(),
        )
    }

    fn stage(
        &self,
        _guard: &PipelineGuard<'_>,
        action: Action,
        key: &str,
        value: Value,
        record: RecordId,
        version: Version,
    ) -> CoreResult<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::StoreClosed);
        }

        if version.is_stamped() {
            let revision = Revision {
                action,
                value,
                version,
            };
            if self.audit_unlocked(key, record).contains(&revision) {
                return Ok(false);
            }
            self.clock.observe(version);
            return self.stage_at(action, key, revision.value, record, version);
        }
        self.stage_at(action, key, value, record, self.clock.now())
    }

    fn stage_at(
        &self,
        action: Action,
        key: &str,
        value: Value,
        record: RecordId,
        version: Version,
    ) -> CoreResult<bool> {
        let present = self.present(key, &value, record);
        let write = match action {
            Action::Add if !present => Write::add(key, value, record),
            Action::Remove if present => Write::remove(key, value, record),
            _ => return Ok(false),
        };
        self.buffer.insert(write.stamped(version))?;
        Ok(true)
    }

    fn present(&self, key: &str, value: &Value, record: RecordId) -> bool {
        let stored = self.database.verify(key, value, record);
        self.buffer.toggles(key, value, record, stored)
    }

    fn fetch_unlocked(&self, key: &str, record: RecordId) -> Vec<Value> {
        let mut values = self.database.fetch(key, record);
        self.buffer.overlay(key, record, &mut values);
        values
    }

    fn audit_unlocked(&self, key: &str, record: RecordId) -> Vec<Revision> {
        let mut history = self.database.audit(key, record);
        // Buffered writes the database already holds were transported just
        // before a crash lost the marker.
        let stored = history.len();
        for revision in self.buffer.history(key, record) {
            if !history[..stored].contains(&revision) {
                history.push(revision);
            }
        }
        history
    }

    /// Current values of `(key, record)` across both tiers.
    #[must_use]
    pub fn fetch(&self, key: &str, record: RecordId) -> Vec<Value> {
        let _pipeline = self.read_lock();
        self.fetch_unlocked(key, record)
    }

    /// Whether `value` is currently associated with `(key, record)`.
    #[must_use]
    pub fn verify(&self, key: &str, value: &Value, record: RecordId) -> bool {
        let _pipeline = self.read_lock();
        self.present(key, value, record)
    }

    /// Every revision of `(key, record)`, oldest first.
    #[must_use]
    pub fn audit(&self, key: &str, record: RecordId) -> Vec<Revision> {
        let _pipeline = self.read_lock();
        self.audit_unlocked(key, record)
    }

    /// Values of `(key, record)` as of `version`, inclusive.
    #[must_use]
    pub fn fetch_at(&self, key: &str, record: RecordId, version: Version) -> Vec<Value> {
        let _pipeline = self.read_lock();
        let mut values: Vec<Value> = Vec::new();
        for revision in self
            .audit_unlocked(key, record)
            .into_iter()
            .filter(|r| r.version <= version)
        {
            match revision.action {
                Action::Add => {
                    if !values.contains(&revision.value) {
                        values.push(revision.value);
                    }
                }
                Action::Remove => values.retain(|v| v != &revision.value),
            }
        }
        values
    }

    /// Keys of `record` that currently hold at least one value.
    #[must_use]
    pub fn describe(&self, record: RecordId) -> BTreeSet<String> {
        let _pipeline = self.read_lock();
        let mut candidates = self.database.keys_ever_in(record);
        candidates.extend(self.buffer.keys_in(record));
        candidates
            .into_iter()
            .filter(|key| !self.fetch_unlocked(key, record).is_empty())
            .collect()
    }

    /// Moves up to `batch` of the oldest buffered writes into the database,
    /// in their original order. Returns how many moved.
    ///
    /// A write the database already holds is still released from the
    /// buffer; the database state is the same either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the buffer log fails. Writes not
    /// yet marked transported stay buffered and are retried next time.
    pub fn transport(&self, batch: usize) -> CoreResult<usize> {
        let _pipeline = self.write_lock();
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }

        let entries = self.buffer.oldest(batch.max(1));
        let Some(last) = entries.last().map(|e| e.seq) else {
            return Ok(0);
        };
        for entry in &entries {
            if !self.database.apply(&entry.write)? {
                tracing::debug!(write = %entry.write, "buffered write already in database");
            }
        }
        self.buffer.mark_transported(last)?;
        tracing::debug!(count = entries.len(), through = last, "transported batch");
        Ok(entries.len())
    }

    /// Transports until the buffer is empty. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Propagates the first transport failure.
    pub fn transport_all(&self, batch: usize) -> CoreResult<usize> {
        let mut total = 0;
        loop {
            let moved = self.transport(batch)?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    /// Closes the pipeline and makes both tiers durable.
    ///
    /// Buffered writes stay in the buffer log and are recovered on the
    /// next open. Calling it twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if either tier fails to sync.
    pub fn shutdown(&self) -> CoreResult<()> {
        let _pipeline = self.write_lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.database.shutdown()?;
        self.buffer.sync()
    }

    /// Whether [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of writes waiting in the buffer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of revisions in the database.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.database.revision_count()
    }

    /// Size of the buffer log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn buffer_log_size(&self) -> CoreResult<u64> {
        self.buffer.log_size()
    }
}

impl std::fmt::Debug for BufferingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferingService")
            .field("buffer", &self.buffer)
            .field("database", &self.database)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use versadb_storage::{InMemoryBackend, SharedMemoryBackend};

    fn service() -> BufferingService {
        BufferingService::new(
            Buffer::open(Box::new(InMemoryBackend::new()), false).unwrap(),
            Database::open(Box::new(InMemoryBackend::new()), false).unwrap(),
            Arc::new(Clock::new()),
        )
    }

    fn bob() -> Value {
        Value::from("Bob")
    }

    #[test]
    fn add_remove_scenario() {
        let service = service();
        let record = RecordId::new(42);
        assert!(service.add("name", bob(), record).unwrap());
        assert!(!service.add("name", bob(), record).unwrap());
        assert!(service.remove("name", bob(), record).unwrap());
        assert!(!service.remove("name", bob(), record).unwrap());
        assert_eq!(service.pending(), 2);
    }

    #[test]
    fn idempotence_spans_both_tiers() {
        let service = service();
        let record = RecordId::new(1);
        service.add("name", bob(), record).unwrap();
        assert_eq!(service.transport_all(16).unwrap(), 1);
        assert_eq!(service.pending(), 0);

        assert!(!service.add("name", bob(), record).unwrap());
        assert!(service.remove("name", bob(), record).unwrap());
        assert!(!service.verify("name", &bob(), record));
        assert!(service.add("name", bob(), record).unwrap());
        assert!(service.verify("name", &bob(), record));
    }

    #[test]
    fn transport_is_invisible_to_reads() {
        let service = service();
        let record = RecordId::new(7);
        service.add("name", bob(), record).unwrap();
        service.add("name", Value::from("Ann"), record).unwrap();
        service.add("age", Value::from(30), record).unwrap();
        service.remove("age", Value::from(30), record).unwrap();

        let before = (
            service.fetch("name", record),
            service.describe(record),
            service.audit("name", record),
        );
        service.transport_all(1).unwrap();
        let after = (
            service.fetch("name", record),
            service.describe(record),
            service.audit("name", record),
        );

        assert_eq!(before, after);
        assert_eq!(after.0, vec![bob(), Value::from("Ann")]);
        assert_eq!(after.1.len(), 1);
        assert_eq!(service.revision_count(), 4);
    }

    #[test]
    fn transport_preserves_order_per_field() {
        let service = service();
        let record = RecordId::new(1);
        for _ in 0..5 {
            service.add("flag", Value::from(true), record).unwrap();
            service.remove("flag", Value::from(true), record).unwrap();
        }
        service.add("flag", Value::from(true), record).unwrap();

        assert_eq!(service.transport(3).unwrap(), 3);
        assert_eq!(service.pending(), 8);
        service.transport_all(3).unwrap();

        let audit = service.audit("flag", record);
        assert_eq!(audit.len(), 11);
        assert!(audit.windows(2).all(|w| w[0].version < w[1].version));
        assert!(service.verify("flag", &Value::from(true), record));
    }

    #[test]
    fn stamps_are_acceptance_instants() {
        let clock = Arc::new(Clock::new());
        let service = BufferingService::new(
            Buffer::open(Box::new(InMemoryBackend::new()), false).unwrap(),
            Database::open(Box::new(InMemoryBackend::new()), false).unwrap(),
            Arc::clone(&clock),
        );
        let before = clock.now();
        service.add("name", bob(), RecordId::new(1)).unwrap();
        let audit = service.audit("name", RecordId::new(1));
        assert!(audit[0].version > before);
        assert_eq!(audit[0].version, clock.last());
    }

    #[test]
    fn fetch_at_spans_tiers() {
        let clock = Arc::new(Clock::new());
        let service = BufferingService::new(
            Buffer::open(Box::new(InMemoryBackend::new()), false).unwrap(),
            Database::open(Box::new(InMemoryBackend::new()), false).unwrap(),
            Arc::clone(&clock),
        );
        let record = RecordId::new(1);
        service.add("name", bob(), record).unwrap();
        let after_add = clock.last();
        service.transport_all(8).unwrap();
        service.remove("name", bob(), record).unwrap();

        assert_eq!(service.fetch_at("name", record, after_add), vec![bob()]);
        assert!(service.fetch_at("name", record, clock.last()).is_empty());
        assert!(service.fetch("name", record).is_empty());
    }

    #[test]
    fn guarded_mutators_share_one_acquisition() {
        let service = service();
        let guard = service.write_lock();
        assert!(service.add_guarded(&guard, "a", bob(), RecordId::new(1)).unwrap());
        assert!(service.remove_guarded(&guard, "a", bob(), RecordId::new(1)).unwrap());
        drop(guard);
        assert!(service.fetch("a", RecordId::new(1)).is_empty());
    }

    #[test]
    fn stamped_writes_apply_once() {
        let service = service();
        let record = RecordId::new(1);
        let writes = [
            Write::add("name", "Bob", record).stamped(Version::new(10)),
            Write::remove("name", "Bob", record).stamped(Version::new(11)),
        ];

        let guard = service.write_lock();
        for write in &writes {
            assert!(service.apply_guarded(&guard, write).unwrap());
        }
        for write in &writes {
            assert!(!service.apply_guarded(&guard, write).unwrap());
        }
        assert!(matches!(
            service.apply_guarded(&guard, &Write::not_for_storage("name", "Bob", record)),
            Err(CoreError::NotForStorage { .. })
        ));
        drop(guard);

        let audit = service.audit("name", record);
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].version, Version::new(11));
        assert!(service.fetch("name", record).is_empty());

        service.transport_all(8).unwrap();
        let guard = service.write_lock();
        assert!(!service.apply_guarded(&guard, &writes[0]).unwrap());
        drop(guard);
        assert_eq!(service.audit("name", record).len(), 2);
    }

    #[test]
    fn lost_transport_marker_is_harmless() {
        let buffer_disk = SharedMemoryBackend::new();
        let database_disk = SharedMemoryBackend::new();
        let open = || {
            BufferingService::new(
                Buffer::open(Box::new(buffer_disk.clone()), false).unwrap(),
                Database::open(Box::new(database_disk.clone()), false).unwrap(),
                Arc::new(Clock::new()),
            )
        };
        let record = RecordId::new(1);
        {
            let service = open();
            service.add("f", Value::from(true), record).unwrap();
            service.remove("f", Value::from(true), record).unwrap();
            service.add("f", Value::from(true), record).unwrap();
            // The batch reaches the database, then the process dies before
            // the marker is written.
            for entry in service.buffer.oldest(8) {
                assert!(service.database.apply(&entry.write).unwrap());
            }
        }

        let service = open();
        assert_eq!(service.pending(), 3);
        assert_eq!(service.audit("f", record).len(), 3);
        assert_eq!(service.fetch("f", record), vec![Value::from(true)]);
        let midway = service.audit("f", record)[1].version;
        assert!(service.fetch_at("f", record, midway).is_empty());

        assert_eq!(service.transport_all(8).unwrap(), 3);
        assert_eq!(service.pending(), 0);
        assert_eq!(service.revision_count(), 3);
        assert_eq!(service.audit("f", record).len(), 3);
        assert_eq!(service.fetch("f", record), vec![Value::from(true)]);
    }

    #[test]
    fn readers_wait_for_the_pipeline() {
        use std::sync::mpsc;
        use std::time::Duration;

        let service = Arc::new(service());
        let guard = service.write_lock();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let values = service.fetch("a", RecordId::new(1));
                tx.send(values).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        service.add_guarded(&guard, "a", bob(), RecordId::new(1)).unwrap();
        drop(guard);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![bob()]);
        reader.join().unwrap();
    }

    #[test]
    fn concurrent_adds_accept_once() {
        let service = Arc::new(service());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || service.add("name", bob(), RecordId::new(1)).unwrap())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn shutdown_closes_the_pipeline() {
        let buffer_disk = SharedMemoryBackend::new();
        let database_disk = SharedMemoryBackend::new();
        {
            let service = BufferingService::new(
                Buffer::open(Box::new(buffer_disk.clone()), false).unwrap(),
                Database::open(Box::new(database_disk.clone()), false).unwrap(),
                Arc::new(Clock::new()),
            );
            service.add("name", bob(), RecordId::new(1)).unwrap();
            service.add("age", Value::from(3), RecordId::new(1)).unwrap();
            service.transport(1).unwrap();
            service.shutdown().unwrap();
            service.shutdown().unwrap();

            assert!(matches!(
                service.add("x", bob(), RecordId::new(1)),
                Err(CoreError::StoreClosed)
            ));
            assert_eq!(service.transport(8).unwrap(), 0);
            assert_eq!(service.fetch("name", RecordId::new(1)), vec![bob()]);
        }

        let clock = Arc::new(Clock::new());
        let service = BufferingService::new(
            Buffer::open(Box::new(buffer_disk), false).unwrap(),
            Database::open(Box::new(database_disk), false).unwrap(),
            Arc::clone(&clock),
        );
        assert_eq!(service.pending(), 1);
        assert_eq!(service.revision_count(), 1);
        assert_eq!(service.describe(RecordId::new(1)).len(), 2);
        let newest = service.audit("age", RecordId::new(1))[0].version;
        assert!(clock.now() > newest);
    }
}
