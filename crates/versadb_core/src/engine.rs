//! The engine: VersaDB's entry point.
//!
//! The engine owns a [`BufferingService`], a [`LockManager`], a
//! [`TaskScheduler`] and a [`Clock`], and coordinates them:
//!
//! - `accept` takes the pipeline lock for exactly one add or remove
//! - isolation locks come from the lock manager and are independent of it
//! - a lifecycle gate is held shared by each accept and each whole commit,
//!   and exclusively by shutdown
//!
//! ```text
//! Constructed ──open──▶ Serving ──shutdown──▶ Draining ──▶ Terminated
//! ```

use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::config::Config;
use crate::database::Database;
use crate::dir::EngineDir;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockGuard, LockManager};
use crate::scheduler::{DroppedTask, TaskContext, TaskScheduler};
use crate::service::BufferingService;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::traits::{Destination, Transactional};
use crate::transaction::{backup, Backup, Transaction};
use crate::types::{RecordId, TransactionId, Version};
use crate::value::Value;
use crate::write::{Revision, Write, WriteKind};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use versadb_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Where the engine is in its life. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    /// Recovering; not yet open to callers.
    Constructed,
    /// Accepting work.
    Serving,
    /// Shutting down; new work is refused.
    Draining,
    /// Shut down.
    Terminated,
}

impl EngineState {
    /// Name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What shutdown had to give up on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Background tasks cancelled or discarded after the grace period.
    pub dropped: Vec<DroppedTask>,
}

impl ShutdownReport {
    /// Whether every background task finished in time.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Proof that the caller holds the lifecycle gate shared.
pub(crate) struct EngineGate<'a> {
    _state: RwLockReadGuard<'a, EngineState>,
}

/// State shared by the engine handle and its transactions.
pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) dir: Option<EngineDir>,
    pub(crate) service: Arc<BufferingService>,
    pub(crate) locks: LockManager,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) clock: Arc<Clock>,
    pub(crate) stats: Arc<EngineStats>,
    lifecycle: RwLock<EngineState>,
    next_txid: AtomicU64,
}

impl EngineInner {
    pub(crate) fn state(&self) -> EngineState {
        *self.lifecycle.read()
    }

    /// Enters the engine for one accept or one commit.
    pub(crate) fn enter(&self) -> CoreResult<EngineGate<'_>> {
        let state = self.lifecycle.read();
        if *state != EngineState::Serving {
            self.stats.record_refused();
            return Err(CoreError::EngineNotServing {
                state: state.as_str(),
            });
        }
        Ok(EngineGate { _state: state })
    }

    pub(crate) fn ensure_serving(&self) -> CoreResult<()> {
        self.enter().map(drop)
    }

    pub(crate) fn backup_path(&self, txid: TransactionId) -> Option<PathBuf> {
        if !self.config.transaction_backups {
            return None;
        }
        self.dir.as_ref().map(|dir| dir.backup_path(txid))
    }

    /// Runs one write through the pipeline.
    ///
    /// Unstamped writes are stamped on acceptance. Stamped writes keep their
    /// version, which is how a replayed backup recognizes what already landed.
    pub(crate) fn accept_within(&self, _gate: &EngineGate<'_>, write: Write) -> CoreResult<bool> {
        let guard = self.service.write_lock();
        let accepted = match write.kind() {
            WriteKind::Add | WriteKind::Remove => self.service.apply_guarded(&guard, &write)?,
            WriteKind::NotForStorage => return Err(CoreError::not_for_storage(write)),
        };
        drop(guard);

        if accepted {
            self.stats.record_accepted();
            tracing::debug!(write = %write, "accepted write");
        } else {
            self.stats.record_duplicate();
            tracing::warn!(
                write = %write,
                "write was previously accepted but not offset; this can happen after a premature \
                 shutdown while the parent transaction restores itself from backup to finish committing"
            );
        }
        Ok(accepted)
    }

    fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next_txid.fetch_add(1, Ordering::Relaxed))
    }

    /// Replays sealed backups left by commits that never finished.
    fn recover_backups(&self) -> CoreResult<u64> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(0);
        };

        let mut max_txid = 0;
        let gate = EngineGate {
            _state: self.lifecycle.read(),
        };
        for (txid, path) in dir.list_backups()? {
            max_txid = max_txid.max(txid.as_u64());
            let Some(writes) = Backup::read(&path)? else {
                tracing::warn!(%txid, "discarding unsealed transaction backup");
                backup::discard(&path)?;
                continue;
            };

            tracing::warn!(%txid, writes = writes.len(), "replaying transaction backup");
            let mut accepted = 0usize;
            for write in writes {
                if self.accept_within(&gate, write)? {
                    accepted += 1;
                }
            }
            self.stats.record_backup_replayed();
            tracing::info!(%txid, accepted, "transaction backup replayed");
            backup::discard(&path)?;
        }
        drop(gate);
        dir.sync_txn_dir()?;
        Ok(max_txid)
    }

    fn start_background_transport(&self) -> CoreResult<()> {
        if !self.config.background_transport {
            return Ok(());
        }
        let service = Arc::clone(&self.service);
        let stats = Arc::clone(&self.stats);
        let batch = self.config.transport_batch_size;
        let interval = self.config.transport_interval;

        self.scheduler.submit("buffer-transport", move |ctx: &TaskContext| {
            while !ctx.is_stopping() {
                match service.transport(batch) {
                    Ok(0) => {
                        if !ctx.sleep(interval) {
                            break;
                        }
                    }
                    Ok(moved) => stats.record_transported(moved),
                    Err(e) => {
                        stats.record_error();
                        tracing::error!(error = %e, "buffer transport failed");
                        if !ctx.sleep(interval) {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn shutdown(&self) -> CoreResult<ShutdownReport> {
        {
            let mut state = self.lifecycle.write();
            if *state >= EngineState::Draining {
                tracing::debug!(state = %*state, "engine already shut down");
                return Ok(ShutdownReport::default());
            }
            *state = EngineState::Draining;
        }
        tracing::info!("engine draining");

        self.scheduler.shutdown();
        let flushed = self.service.shutdown();
        if let Err(e) = &flushed {
            tracing::error!(error = %e, "failed to flush storage during shutdown");
        }

        let mut report = ShutdownReport::default();
        if !self.scheduler.await_termination(self.config.shutdown_grace) {
            report.dropped = self.scheduler.shutdown_now();
            for task in &report.dropped {
                tracing::error!(
                    task = %task.name,
                    was_running = task.was_running,
                    "background task did not finish before shutdown"
                );
            }
        }

        *self.lifecycle.write() = EngineState::Terminated;
        tracing::info!("engine has shut down");
        flushed.map(|()| report)
    }
}

/// A VersaDB engine.
///
/// # Example
///
/// ```rust
/// use versadb_core::{Engine, RecordId, Transactional, Value};
///
/// let engine = Engine::open_in_memory().unwrap();
/// assert!(engine.add("name", "Bob", RecordId::new(42)).unwrap());
/// assert!(!engine.add("name", "Bob", RecordId::new(42)).unwrap());
///
/// let mut txn = engine.start_transaction().unwrap();
/// txn.remove("name", "Bob", RecordId::new(42)).unwrap();
/// txn.commit().unwrap();
///
/// assert!(engine.fetch("name", RecordId::new(42)).is_empty());
/// engine.shutdown().unwrap();
/// ```
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Opens the engine stored in `path` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked by another process, a
    /// log is corrupt, or I/O fails.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens the engine stored in `path`.
    ///
    /// Recovers the buffer and the database from their logs, then replays
    /// any sealed transaction backups.
    ///
    /// # Errors
    ///
    /// As [`Self::open`].
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = EngineDir::open(path, config.create_if_missing)?;
        let buffer = FileBackend::open(&dir.buffer_path())?;
        let database = FileBackend::open(&dir.database_path())?;
        Self::assemble(Some(dir), Box::new(buffer), Box::new(database), config)
    }

    /// Opens an engine over caller-supplied backends. No directory, so no
    /// transaction backups.
    ///
    /// # Errors
    ///
    /// Returns an error if a log is corrupt or a worker cannot be spawned.
    pub fn open_with_backends(
        config: Config,
        buffer: Box<dyn StorageBackend>,
        database: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        Self::assemble(None, buffer, database, config)
    }

    /// Opens an ephemeral engine.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker cannot be spawned.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens an ephemeral engine with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker cannot be spawned.
    pub fn open_in_memory_with_config(config: Config) -> CoreResult<Self> {
        Self::open_with_backends(
            config,
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    fn assemble(
        dir: Option<EngineDir>,
        buffer: Box<dyn StorageBackend>,
        database: Box<dyn StorageBackend>,
        config: Config,
    ) -> CoreResult<Self> {
        let clock = Arc::new(Clock::new());
        let buffer = Buffer::open(buffer, config.sync_on_insert)?;
        let database = Database::open(database, config.sync_on_insert)?;
        let service = Arc::new(BufferingService::new(buffer, database, Arc::clone(&clock)));
        let scheduler = TaskScheduler::new("versadb-worker", config.worker_threads)?;

        let inner = Arc::new(EngineInner {
            config,
            dir,
            service,
            locks: LockManager::new(),
            scheduler,
            clock,
            stats: Arc::new(EngineStats::new()),
            lifecycle: RwLock::new(EngineState::Constructed),
            next_txid: AtomicU64::new(1),
        });

        let max_txid = inner.recover_backups()?;
        inner.next_txid.store(max_txid + 1, Ordering::Relaxed);

        *inner.lifecycle.write() = EngineState::Serving;
        inner.start_background_transport()?;
        tracing::info!(
            path = ?inner.dir.as_ref().map(EngineDir::path),
            pending = inner.service.pending(),
            revisions = inner.service.revision_count(),
            "engine is serving"
        );

        Ok(Self { inner })
    }

    /// Isolates `(key, record)` for a single writer.
    pub fn lock_and_isolate(&self, key: &str, record: RecordId) -> LockGuard {
        self.inner.locks.lock_and_isolate(key, record)
    }

    /// Shares every field of `record`.
    pub fn lock_and_share_record(&self, record: RecordId) -> LockGuard {
        self.inner.locks.lock_and_share_record(record)
    }

    /// Shares `key` across every record.
    pub fn lock_and_share_key(&self, key: &str) -> LockGuard {
        self.inner.locks.lock_and_share_key(key)
    }

    /// Shares the `(key, record)` field.
    pub fn lock_and_share(&self, key: &str, record: RecordId) -> LockGuard {
        self.inner.locks.lock_and_share(key, record)
    }

    /// Adds `value` to `(key, record)` outside any transaction.
    ///
    /// # Errors
    ///
    /// As [`Destination::accept`].
    pub fn add(&self, key: &str, value: impl Into<Value>, record: RecordId) -> CoreResult<bool> {
        let _lock = self.lock_and_isolate(key, record);
        self.accept(Write::add(key, value, record))
    }

    /// Removes `value` from `(key, record)` outside any transaction.
    ///
    /// # Errors
    ///
    /// As [`Destination::accept`].
    pub fn remove(&self, key: &str, value: impl Into<Value>, record: RecordId) -> CoreResult<bool> {
        let _lock = self.lock_and_isolate(key, record);
        self.accept(Write::remove(key, value, record))
    }

    /// Current values of `(key, record)`.
    #[must_use]
    pub fn fetch(&self, key: &str, record: RecordId) -> Vec<Value> {
        let _lock = self.lock_and_share(key, record);
        self.inner.service.fetch(key, record)
    }

    /// Values of `(key, record)` as of `version`.
    #[must_use]
    pub fn fetch_at(&self, key: &str, record: RecordId, version: Version) -> Vec<Value> {
        let _lock = self.lock_and_share(key, record);
        self.inner.service.fetch_at(key, record, version)
    }

    /// Whether `value` is associated with `(key, record)`.
    #[must_use]
    pub fn verify(&self, key: &str, value: &Value, record: RecordId) -> bool {
        let _lock = self.lock_and_share(key, record);
        self.inner.service.verify(key, value, record)
    }

    /// Every revision of `(key, record)`, oldest first.
    #[must_use]
    pub fn audit(&self, key: &str, record: RecordId) -> Vec<Revision> {
        let _lock = self.lock_and_share(key, record);
        self.inner.service.audit(key, record)
    }

    /// Keys of `record` that currently hold a value.
    #[must_use]
    pub fn describe(&self, record: RecordId) -> BTreeSet<String> {
        let _lock = self.lock_and_share_record(record);
        self.inner.service.describe(record)
    }

    /// Runs `f` in a transaction, committing on `Ok` and aborting on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or from starting or committing.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.start_transaction()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }

    /// Moves every buffered write into the database now.
    ///
    /// # Errors
    ///
    /// Propagates the first transport failure.
    pub fn transport_all(&self) -> CoreResult<usize> {
        let moved = self
            .inner
            .service
            .transport_all(self.inner.config.transport_batch_size)?;
        self.inner.stats.record_transported(moved);
        Ok(moved)
    }

    /// Runs `work` on the engine's scheduler.
    ///
    /// Long-running work should check [`TaskContext::is_stopping`] so that
    /// shutdown can finish within its grace period.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::SchedulerShutdown`] once shutdown has begun.
    pub fn spawn_task<F>(&self, name: impl Into<String>, work: F) -> CoreResult<()>
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        self.inner.scheduler.submit(name, work)
    }

    /// Drains and stops the engine.
    ///
    /// Waits for in-flight accepts and commits, refuses new ones, stops
    /// background intake, flushes both tiers, then waits up to the
    /// configured grace period for background tasks. Tasks still running
    /// after that are cancelled and listed in the report.
    ///
    /// A second call does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails. The engine is terminated
    /// either way.
    pub fn shutdown(&self) -> CoreResult<ShutdownReport> {
        self.inner.shutdown()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Activity counters and gauges.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            pending: self.inner.service.pending(),
            revisions: self.inner.service.revision_count(),
            locks_held: self.inner.locks.held_count(),
            ..self.inner.stats.snapshot()
        }
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// The engine directory, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.dir.as_ref().map(EngineDir::path)
    }

    /// The configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Destination for Engine {
    fn accept(&self, write: Write) -> CoreResult<bool> {
        if !write.is_storable() {
            return Err(CoreError::not_for_storage(write));
        }
        let gate = self.inner.enter()?;
        self.inner.accept_within(&gate, write)
    }
}

impl Transactional for Engine {
    fn start_transaction(&self) -> CoreResult<Transaction> {
        self.inner.ensure_serving()?;
        let id = self.inner.next_transaction_id();
        self.inner.stats.record_transaction_start();
        tracing::trace!(txid = %id, "transaction started");
        Ok(Transaction::new(Arc::clone(&self.inner), id))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "engine shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("path", &self.path())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
