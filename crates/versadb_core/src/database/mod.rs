//! The database: durable, indexed state behind the buffer.
//!
//! Every accepted mutation is appended to a revision log and applied to an
//! in-memory index holding, per `(key, record)` field, the current values and
//! the full history. The index is rebuilt from the log on open.
//!
//! `add` and `remove` are idempotent: applying the same change twice leaves
//! state unchanged and reports `false` the second time. A revision whose
//! exact `(action, value, version)` is already in the field's history is
//! rejected outright, so re-transporting a batch whose transport marker was
//! lost applies nothing twice.

mod record;

use crate::error::{CoreError, CoreResult};
use crate::log::{FrameIterator, FramedLog, LogFormat};
use crate::types::{RecordId, Version};
use crate::value::Value;
use crate::write::{Action, Revision, Write, WriteKind};
use parking_lot::{Mutex, RwLock};
use record::RevisionRecord;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use versadb_storage::StorageBackend;

#[derive(Debug, Default)]
struct FieldState {
    values: Vec<Value>,
    history: Vec<Revision>,
}

#[derive(Debug, Default)]
struct Index {
    fields: HashMap<(RecordId, String), FieldState>,
    records: HashMap<RecordId, BTreeSet<String>>,
    latest: Version,
    revisions: usize,
}

impl Index {
    fn field(&self, key: &str, record: RecordId) -> Option<&FieldState> {
        self.fields.get(&(record, key.to_string()))
    }

    fn holds(&self, key: &str, record: RecordId, revision: &Revision) -> bool {
        self.field(key, record)
            .is_some_and(|f| f.history.contains(revision))
    }

    fn contains(&self, key: &str, value: &Value, record: RecordId) -> bool {
        self.field(key, record)
            .is_some_and(|f| f.values.contains(value))
    }

    fn apply(&mut self, key: &str, record: RecordId, revision: Revision) {
        let field = self
            .fields
            .entry((record, key.to_string()))
            .or_default();
        match revision.action {
            Action::Add => {
                if !field.values.contains(&revision.value) {
                    field.values.push(revision.value.clone());
                }
            }
            Action::Remove => field.values.retain(|v| v != &revision.value),
        }
        self.latest = self.latest.max(revision.version);
        self.revisions += 1;
        field.history.push(revision);
        self.records
            .entry(record)
            .or_default()
            .insert(key.to_string());
    }
}

/// The durable store.
pub struct Database {
    log: Mutex<FramedLog>,
    index: RwLock<Index>,
    closed: AtomicBool,
}

impl Database {
    /// Opens a database over `backend`, rebuilding the index from its log.
    ///
    /// # Errors
    ///
    /// Returns an error if the revision log is corrupt or cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> CoreResult<Self> {
        let mut log = FramedLog::new(LogFormat::DATABASE, backend, sync_on_write);
        let mut index = Index::default();

        let summary = log.replay(|frame| {
            let entry = RevisionRecord::from_frame(frame)?;
            index.apply(&entry.key, entry.record, entry.revision);
            Ok(())
        })?;
        if summary.frames > 0 {
            tracing::info!(
                revisions = summary.frames,
                fields = index.fields.len(),
                "recovered database"
            );
        }

        Ok(Self {
            log: Mutex::new(log),
            index: RwLock::new(index),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    fn mutate(
        &self,
        action: Action,
        key: &str,
        value: Value,
        record: RecordId,
        version: Version,
    ) -> CoreResult<bool> {
        let mut index = self.index.write();
        self.ensure_open()?;
        let revision = Revision {
            action,
            value,
            version,
        };
        // A revision already in the history was applied before a crash cut
        // off whatever recorded that fact.
        if version.is_stamped() && index.holds(key, record, &revision) {
            return Ok(false);
        }
        let present = index.contains(key, &revision.value, record);
        let applies = match action {
            Action::Add => !present,
            Action::Remove => present,
        };
        if !applies {
            return Ok(false);
        }

        let entry = RevisionRecord {
            key: key.to_string(),
            record,
            revision,
        };
        self.log.lock().append(RevisionRecord::KIND, &entry)?;
        index.apply(&entry.key, entry.record, entry.revision);
        Ok(true)
    }

    /// Associates `value` with `key` in `record`.
    ///
    /// Returns `true` if the value was not already associated, `false` (and
    /// changes nothing) if it was.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StoreClosed`] after shutdown, or on I/O error.
    pub fn add(&self, key: &str, value: Value, record: RecordId, version: Version) -> CoreResult<bool> {
        self.mutate(Action::Add, key, value, record, version)
    }

    /// Dissociates `value` from `key` in `record`.
    ///
    /// Returns `true` if the value was associated and no longer is, `false`
    /// (and changes nothing) otherwise.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::StoreClosed`] after shutdown, or on I/O error.
    pub fn remove(
        &self,
        key: &str,
        value: Value,
        record: RecordId,
        version: Version,
    ) -> CoreResult<bool> {
        self.mutate(Action::Remove, key, value, record, version)
    }

    /// Applies a buffered write.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotForStorage`] for a write that must never be
    /// stored, or as [`Self::add`] / [`Self::remove`] do.
    pub fn apply(&self, write: &Write) -> CoreResult<bool> {
        match write.kind() {
            WriteKind::Add => self.add(
                write.key(),
                write.value().clone(),
                write.record(),
                write.version(),
            ),
            WriteKind::Remove => self.remove(
                write.key(),
                write.value().clone(),
                write.record(),
                write.version(),
            ),
            WriteKind::NotForStorage => Err(CoreError::not_for_storage(write.clone())),
        }
    }

    /// Current values of `(key, record)`, in the order they were added.
    #[must_use]
    pub fn fetch(&self, key: &str, record: RecordId) -> Vec<Value> {
        self.index
            .read()
            .field(key, record)
            .map(|f| f.values.clone())
            .unwrap_or_default()
    }

    /// Whether `revision` is already in the history of `(key, record)`.
    #[must_use]
    pub fn holds(&self, key: &str, record: RecordId, revision: &Revision) -> bool {
        self.index.read().holds(key, record, revision)
    }

    /// Whether `value` is currently associated with `key` in `record`.
    #[must_use]
    pub fn verify(&self, key: &str, value: &Value, record: RecordId) -> bool {
        self.index.read().contains(key, value, record)
    }

    /// Every revision of `(key, record)`, oldest first.
    #[must_use]
    pub fn audit(&self, key: &str, record: RecordId) -> Vec<Revision> {
        self.index
            .read()
            .field(key, record)
            .map(|f| f.history.clone())
            .unwrap_or_default()
    }

    /// Values of `(key, record)` as of `version`, inclusive.
    #[must_use]
    pub fn fetch_at(&self, key: &str, record: RecordId, version: Version) -> Vec<Value> {
        let index = self.index.read();
        let Some(field) = index.field(key, record) else {
            return Vec::new();
        };
        let mut values = Vec::new();
        for revision in field.history.iter().filter(|r| r.version <= version) {
            match revision.action {
                Action::Add => {
                    if !values.contains(&revision.value) {
                        values.push(revision.value.clone());
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
        let index = self.index.read();
        index
            .records
            .get(&record)
            .map(|keys| {
                keys.iter()
                    .filter(|k| index.field(k, record).is_some_and(|f| !f.values.is_empty()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of `record` that have ever held a value.
    #[must_use]
    pub fn keys_ever_in(&self, record: RecordId) -> BTreeSet<String> {
        self.index
            .read()
            .records
            .get(&record)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest version applied so far.
    #[must_use]
    pub fn latest_version(&self) -> Version {
        self.index.read().latest
    }

    /// Number of revisions applied so far.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.index.read().revisions
    }

    /// Makes every applied revision durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.log.lock().sync()
    }

    /// Flushes and syncs pending revisions, then refuses further mutations.
    ///
    /// Reads keep working. Calling it twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn shutdown(&self) -> CoreResult<()> {
        // Block out in-flight mutations before the final sync.
        let _index = self.index.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.log.lock().sync()
    }

    /// Whether [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What a read-only pass over a revision log found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseScan {
    /// Revisions in the log.
    pub revisions: usize,
    /// Distinct `(key, record)` fields ever written.
    pub fields: usize,
    /// Fields currently holding at least one value.
    pub live_fields: usize,
    /// Distinct records ever written.
    pub records: usize,
    /// Highest version seen.
    pub latest: Version,
    /// Whether the log ends in an incomplete frame.
    pub torn_tail: bool,
}

impl Database {
    /// Reads a revision log without opening it. Nothing is truncated.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupt or cannot be read.
    pub fn scan(backend: &dyn StorageBackend) -> CoreResult<DatabaseScan> {
        let mut iter = FrameIterator::new(backend, LogFormat::DATABASE)?;
        let mut index = Index::default();
        for frame in iter.by_ref() {
            let entry = RevisionRecord::from_frame(&frame?)?;
            index.apply(&entry.key, entry.record, entry.revision);
        }
        Ok(DatabaseScan {
            revisions: index.revisions,
            fields: index.fields.len(),
            live_fields: index.fields.values().filter(|f| !f.values.is_empty()).count(),
            records: index.records.len(),
            latest: index.latest,
            torn_tail: iter.torn_tail(),
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("revisions", &self.revision_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
