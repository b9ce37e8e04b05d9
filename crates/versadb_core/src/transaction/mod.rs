//! Transactions.
//!
//! A transaction stages writes locally while holding isolation locks on
//! every field it touches, then hands them to the engine as one unit. The
//! engine's lifecycle gate is held for the whole commit, so shutdown can
//! never cut a commit in half; the pipeline lock is taken once per write,
//! so transport keeps running while a long commit is in progress.

pub(crate) mod backup;
mod state;

pub use backup::Backup;
pub use state::TransactionState;

use crate::engine::EngineInner;
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockGuard, LockMode, LockOwner, LockScope};
use crate::types::{RecordId, TransactionId, Version};
use crate::value::Value;
use crate::write::{Action, Revision, Write};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// The committed transaction.
    pub txid: TransactionId,
    /// Instant the commit entered the engine. Every write it applied is
    /// versioned at or after this.
    pub commit_version: Version,
    /// Writes the engine accepted.
    pub accepted: usize,
    /// Writes the engine rejected as already applied.
    pub duplicates: usize,
}

/// A unit of atomic work against an [`crate::Engine`].
///
/// Reads see the engine state overlaid with this transaction's own staged
/// writes. Other owners cannot observe staged writes: nothing leaves the
/// transaction before commit, and fields it wrote stay isolated until the
/// commit has finished.
///
/// Dropping an active transaction aborts it.
pub struct Transaction {
    engine: Arc<EngineInner>,
    id: TransactionId,
    owner: LockOwner,
    state: TransactionState,
    writes: Vec<Write>,
    locks: HashMap<(LockScope, LockMode), LockGuard>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<EngineInner>, id: TransactionId) -> Self {
        let owner = engine.locks.new_owner();
        Self {
            engine,
            id,
            owner,
            state: TransactionState::Active,
            writes: Vec::new(),
            locks: HashMap::new(),
        }
    }

    /// The transaction identifier.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Writes staged so far, in order.
    #[must_use]
    pub fn staged(&self) -> &[Write] {
        &self.writes
    }

    /// The identity under which this transaction holds its locks.
    #[must_use]
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    fn ensure_active(&self) -> CoreResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(CoreError::TransactionNotActive {
                txid: self.id.as_u64(),
                state: self.state.as_str(),
            })
        }
    }

    fn lock(&mut self, scope: LockScope, mode: LockMode) {
        let isolated = (scope.clone(), LockMode::Isolated);
        if self.locks.contains_key(&isolated) {
            return;
        }
        let key = (scope, mode);
        if self.locks.contains_key(&key) {
            return;
        }
        let guard = self.engine.locks.acquire(key.0.clone(), mode, self.owner);
        self.locks.insert(key, guard);
    }

    fn local_present(&self, key: &str, value: &Value, record: RecordId, base: bool) -> bool {
        self.writes
            .iter()
            .filter(|w| w.matches(key, value, record))
            .fold(base, |present, w| match w.kind().action() {
                Some(Action::Add) => true,
                Some(Action::Remove) => false,
                None => present,
            })
    }

    fn present(&self, key: &str, value: &Value, record: RecordId) -> bool {
        let stored = self.engine.service.verify(key, value, record);
        self.local_present(key, value, record, stored)
    }

    fn stage(&mut self, action: Action, key: &str, value: Value, record: RecordId) -> CoreResult<bool> {
        self.ensure_active()?;
        self.engine.ensure_serving()?;
        self.lock(LockScope::Field(key.to_string(), record), LockMode::Isolated);

        let present = self.present(key, &value, record);
        let write = match action {
            Action::Add if !present => Write::add(key, value, record),
            Action::Remove if present => Write::remove(key, value, record),
            _ => return Ok(false),
        };
        self.writes.push(write.stamped(self.engine.clock.now()));
        Ok(true)
    }

    /// Stages adding `value` to `(key, record)`.
    ///
    /// Returns `false` if the value is already present as this transaction
    /// sees it.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the engine is not serving.
    pub fn add(&mut self, key: &str, value: impl Into<Value>, record: RecordId) -> CoreResult<bool> {
        self.stage(Action::Add, key, value.into(), record)
    }

    /// Stages removing `value` from `(key, record)`.
    ///
    /// Returns `false` if the value is not present as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the engine is not serving.
    pub fn remove(
        &mut self,
        key: &str,
        value: impl Into<Value>,
        record: RecordId,
    ) -> CoreResult<bool> {
        self.stage(Action::Remove, key, value.into(), record)
    }

    fn fetch_overlaid(&self, key: &str, record: RecordId) -> Vec<Value> {
        let mut values = self.engine.service.fetch(key, record);
        for write in self
            .writes
            .iter()
            .filter(|w| w.record() == record && w.key() == key)
        {
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
        values
    }

    /// Current values of `(key, record)` including staged writes.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active.
    pub fn fetch(&mut self, key: &str, record: RecordId) -> CoreResult<Vec<Value>> {
        self.ensure_active()?;
        self.lock(LockScope::Field(key.to_string(), record), LockMode::Shared);
        Ok(self.fetch_overlaid(key, record))
    }

    /// Whether `value` is associated with `(key, record)` including staged writes.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active.
    pub fn verify(&mut self, key: &str, value: impl Into<Value>, record: RecordId) -> CoreResult<bool> {
        self.ensure_active()?;
        self.lock(LockScope::Field(key.to_string(), record), LockMode::Shared);
        Ok(self.present(key, &value.into(), record))
    }

    /// History of `(key, record)`, followed by staged changes.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active.
    pub fn audit(&mut self, key: &str, record: RecordId) -> CoreResult<Vec<Revision>> {
        self.ensure_active()?;
        self.lock(LockScope::Field(key.to_string(), record), LockMode::Shared);
        let mut history = self.engine.service.audit(key, record);
        history.extend(
            self.writes
                .iter()
                .filter(|w| w.record() == record && w.key() == key)
                .filter_map(Write::to_revision),
        );
        Ok(history)
    }

    /// Keys of `record` holding at least one value, including staged writes.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active.
    pub fn describe(&mut self, record: RecordId) -> CoreResult<BTreeSet<String>> {
        self.ensure_active()?;
        self.lock(LockScope::Record(record), LockMode::Shared);
        let mut keys = self.engine.service.describe(record);
        for write in self.writes.iter().filter(|w| w.record() == record) {
            keys.insert(write.key().to_string());
        }
        Ok(keys
            .into_iter()
            .filter(|key| !self.fetch_overlaid(key, record).is_empty())
            .collect())
    }

    /// Applies every staged write through the engine as one unit.
    ///
    /// When the engine has a directory, the writes are first sealed in a
    /// backup that survives a crash mid-commit. Each write is re-stamped at
    /// commit time and the backup carries those stamps, so replaying it
    /// skips every write that already landed. Locks are released when this
    /// returns.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active, the engine is not serving,
    /// or a write cannot be persisted. A failed commit leaves the
    /// transaction aborted; a sealed backup, if any, is kept for recovery.
    pub fn commit(mut self) -> CoreResult<CommitReceipt> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;

        match self.apply_all() {
            Ok(receipt) => {
                self.state = TransactionState::Committed;
                self.engine.stats.record_transaction_commit();
                tracing::debug!(
                    txid = %self.id,
                    accepted = receipt.accepted,
                    duplicates = receipt.duplicates,
                    "transaction committed"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.state = TransactionState::Aborted;
                self.engine.stats.record_transaction_abort();
                tracing::error!(txid = %self.id, error = %e, "transaction commit failed");
                Err(e)
            }
        }
    }

    fn apply_all(&mut self) -> CoreResult<CommitReceipt> {
        let engine = Arc::clone(&self.engine);
        let gate = engine.enter()?;
        let commit_version = engine.clock.now();
        let writes: Vec<Write> = std::mem::take(&mut self.writes)
            .iter()
            .map(|w| w.stamped(engine.clock.now()))
            .collect();

        let backup = match engine.backup_path(self.id) {
            Some(path) if !writes.is_empty() => Some(Backup::write(&path, self.id, &writes)?),
            _ => None,
        };

        let mut receipt = CommitReceipt {
            txid: self.id,
            commit_version,
            accepted: 0,
            duplicates: 0,
        };
        for write in writes {
            if engine.accept_within(&gate, write)? {
                receipt.accepted += 1;
            } else {
                receipt.duplicates += 1;
            }
        }

        if let Some(backup) = backup {
            backup.discard()?;
        }
        drop(gate);
        self.locks.clear();
        Ok(receipt)
    }

    /// Discards staged writes and releases every lock.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active.
    pub fn abort(mut self) -> CoreResult<()> {
        self.ensure_active()?;
        self.rollback();
        Ok(())
    }

    fn rollback(&mut self) {
        self.state = TransactionState::Aborted;
        self.writes.clear();
        self.locks.clear();
        self.engine.stats.record_transaction_abort();
        tracing::debug!(txid = %self.id, "transaction aborted");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.rollback();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("staged", &self.writes.len())
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::error::CoreError;
    use crate::traits::Transactional;
    use crate::types::RecordId;
    use crate::value::Value;
    use crate::write::Action;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use super::TransactionState;

    fn engine() -> Engine {
        Engine::open_in_memory_with_config(Config::default().background_transport(false)).unwrap()
    }

    #[test]
    fn staged_writes_are_local_until_commit() {
        let engine = engine();
        let mut txn = engine.start_transaction().unwrap();
        assert!(txn.add("name", "Bob", RecordId::new(42)).unwrap());
        assert!(!txn.add("name", "Bob", RecordId::new(42)).unwrap());
        assert_eq!(txn.fetch("name", RecordId::new(42)).unwrap(), vec![Value::from("Bob")]);

        // Nothing has reached the pipeline yet.
        assert_eq!(engine.stats().accepted, 0);
        assert_eq!(engine.stats().pending, 0);

        let receipt = txn.commit().unwrap();
        assert_eq!(receipt.accepted, 1);
        assert_eq!(receipt.duplicates, 0);
        assert_eq!(engine.fetch("name", RecordId::new(42)), vec![Value::from("Bob")]);
    }

    #[test]
    fn idempotence_sees_local_writes() {
        let engine = engine();
        let record = RecordId::new(42);
        let mut txn = engine.start_transaction().unwrap();
        assert!(!txn.remove("name", "Bob", record).unwrap());
        assert!(txn.add("name", "Bob", record).unwrap());
        assert!(txn.remove("name", "Bob", record).unwrap());
        assert!(!txn.remove("name", "Bob", record).unwrap());
        assert!(!txn.verify("name", "Bob", record).unwrap());
        assert_eq!(txn.staged().len(), 2);

        let audit = txn.audit("name", record).unwrap();
        assert_eq!(
            audit.iter().map(|r| r.action).collect::<Vec<_>>(),
            vec![Action::Add, Action::Remove]
        );

        let receipt = txn.commit().unwrap();
        assert_eq!(receipt.accepted, 2);
        assert!(!engine.verify("name", &Value::from("Bob"), record));
        assert_eq!(engine.audit("name", record).len(), 2);
    }

    #[test]
    fn abort_discards_and_releases() {
        let engine = engine();
        let mut txn = engine.start_transaction().unwrap();
        txn.add("name", "Bob", RecordId::new(1)).unwrap();
        assert_eq!(engine.locks().held_count(), 1);

        txn.abort().unwrap();
        assert_eq!(engine.locks().held_count(), 0);
        assert!(engine.fetch("name", RecordId::new(1)).is_empty());
        assert_eq!(engine.stats().transactions_aborted, 1);
    }

    #[test]
    fn drop_aborts() {
        let engine = engine();
        {
            let mut txn = engine.start_transaction().unwrap();
            txn.add("name", "Bob", RecordId::new(1)).unwrap();
        }
        assert_eq!(engine.locks().held_count(), 0);
        assert!(engine.fetch("name", RecordId::new(1)).is_empty());
    }

    #[test]
    fn commit_releases_locks() {
        let engine = engine();
        let mut txn = engine.start_transaction().unwrap();
        txn.add("a", 1, RecordId::new(1)).unwrap();
        txn.fetch("b", RecordId::new(1)).unwrap();
        txn.describe(RecordId::new(1)).unwrap();
        assert_eq!(engine.locks().held_count(), 3);

        txn.commit().unwrap();
        assert_eq!(engine.locks().held_count(), 0);
        assert_eq!(engine.locks().table_size(), 0);
    }

    #[test]
    fn share_then_isolate_is_reentrant() {
        let engine = engine();
        let mut txn = engine.start_transaction().unwrap();
        assert!(txn.describe(RecordId::new(1)).unwrap().is_empty());
        assert!(txn.add("name", "Bob", RecordId::new(1)).unwrap());
        let keys: Vec<String> = txn.describe(RecordId::new(1)).unwrap().into_iter().collect();
        assert_eq!(keys, vec!["name".to_string()]);
        txn.commit().unwrap();
    }

    #[test]
    fn readers_never_see_partial_commit() {
        let engine = Arc::new(engine());
        let record = RecordId::new(1);
        let mut txn = engine.start_transaction().unwrap();
        txn.add("a", "x", record).unwrap();
        txn.add("b", "y", record).unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let described = engine.describe(record);
                tx.send(described).unwrap();
            })
        };
        // Blocked on the isolated fields.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        txn.commit().unwrap();
        let described = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(described.len(), 2);
        reader.join().unwrap();
    }

    #[test]
    fn finished_transaction_rejects_use() {
        let engine = engine();
        let mut txn = engine.start_transaction().unwrap();
        txn.add("a", 1, RecordId::new(1)).unwrap();
        assert_eq!(txn.state(), TransactionState::Active);

        // Commit consumes the transaction; exercise the guard directly.
        txn.state = TransactionState::Committed;
        assert!(matches!(
            txn.add("a", 2, RecordId::new(1)),
            Err(CoreError::TransactionNotActive { state: "committed", .. })
        ));
        assert!(txn.state().is_terminal());
    }

    #[test]
    fn re_timestamped_at_acceptance() {
        let engine = engine();
        let record = RecordId::new(42);
        let mut txn = engine.start_transaction().unwrap();
        txn.add("name", "Bob", record).unwrap();
        let staged_at = txn.staged()[0].version();

        let receipt = txn.commit().unwrap();
        let committed = engine.audit("name", record)[0].version;
        assert!(receipt.commit_version > staged_at);
        assert!(committed >= receipt.commit_version);
    }

    #[test]
    fn commit_after_shutdown_is_refused() {
        let engine = engine();
        let mut txn = engine.start_transaction().unwrap();
        txn.add("name", "Bob", RecordId::new(1)).unwrap();
        engine.shutdown().unwrap();

        assert!(matches!(
            txn.commit(),
            Err(CoreError::EngineNotServing { .. })
        ));
        assert_eq!(engine.stats().transactions_aborted, 1);
        assert!(engine.fetch("name", RecordId::new(1)).is_empty());
    }
}
