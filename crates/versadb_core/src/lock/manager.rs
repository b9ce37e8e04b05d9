//! The lock table.

use crate::lock::scope::{LockMode, LockOwner, LockScope};
use crate::types::RecordId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Holding {
    owner: LockOwner,
    mode: LockMode,
    count: usize,
}

/// Canonical entry for one scope. Lives while anything holds or waits on it.
#[derive(Debug, Default)]
struct Entry {
    holders: Vec<Holding>,
    waiters: usize,
}

impl Entry {
    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.waiters == 0
    }
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<LockScope, Entry>,
}

impl Table {
    fn conflicts(&self, scope: &LockScope, mode: LockMode, owner: LockOwner) -> bool {
        self.entries.iter().any(|(held_scope, entry)| {
            held_scope.intersects(scope)
                && entry
                    .holders
                    .iter()
                    .any(|h| h.owner != owner && !h.mode.compatible(mode))
        })
    }

    fn grant(&mut self, scope: &LockScope, mode: LockMode, owner: LockOwner) {
        let entry = self.entries.entry(scope.clone()).or_default();
        match entry
            .holders
            .iter_mut()
            .find(|h| h.owner == owner && h.mode == mode)
        {
            Some(holding) => holding.count += 1,
            None => entry.holders.push(Holding {
                owner,
                mode,
                count: 1,
            }),
        }
    }

    fn release(&mut self, scope: &LockScope, mode: LockMode, owner: LockOwner) {
        let Some(entry) = self.entries.get_mut(scope) else {
            return;
        };
        if let Some(pos) = entry
            .holders
            .iter()
            .position(|h| h.owner == owner && h.mode == mode)
        {
            entry.holders[pos].count -= 1;
            if entry.holders[pos].count == 0 {
                entry.holders.swap_remove(pos);
            }
        }
        if entry.is_unused() {
            self.entries.remove(scope);
        }
    }
}

#[derive(Debug)]
struct Shared {
    table: Mutex<Table>,
    released: Condvar,
    next_owner: AtomicU64,
}

/// Grants shared and isolated locks over records, keys and fields.
///
/// The manager owns an explicit lock table: one canonical entry per scope,
/// created on first request and removed once nothing holds or waits on it.
/// Two requests conflict when their scopes intersect, at least one is
/// isolated, and they come from different owners.
///
/// Acquisition blocks until the lock is granted. There is no timeout and no
/// deadlock detection; callers acquire in a consistent order.
///
/// Cloning yields another handle to the same table.
#[derive(Debug, Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                released: Condvar::new(),
                next_owner: AtomicU64::new(1),
            }),
        }
    }

    /// Allocates a fresh owner identity.
    pub fn new_owner(&self) -> LockOwner {
        LockOwner(self.shared.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Isolates the `(key, record)` field for a single writer.
    pub fn lock_and_isolate(&self, key: &str, record: RecordId) -> LockGuard {
        let owner = self.new_owner();
        self.acquire(LockScope::Field(key.to_string(), record), LockMode::Isolated, owner)
    }

    /// Shares every field of `record`.
    pub fn lock_and_share_record(&self, record: RecordId) -> LockGuard {
        let owner = self.new_owner();
        self.acquire(LockScope::Record(record), LockMode::Shared, owner)
    }

    /// Shares `key` across every record.
    pub fn lock_and_share_key(&self, key: &str) -> LockGuard {
        let owner = self.new_owner();
        self.acquire(LockScope::Key(key.to_string()), LockMode::Shared, owner)
    }

    /// Shares the `(key, record)` field.
    pub fn lock_and_share(&self, key: &str, record: RecordId) -> LockGuard {
        let owner = self.new_owner();
        self.acquire(LockScope::Field(key.to_string(), record), LockMode::Shared, owner)
    }

    /// Blocks until `owner` holds `scope` in `mode`.
    pub fn acquire(&self, scope: LockScope, mode: LockMode, owner: LockOwner) -> LockGuard {
        let mut table = self.shared.table.lock();
        if table.conflicts(&scope, mode, owner) {
            table.entries.entry(scope.clone()).or_default().waiters += 1;
            tracing::trace!(%scope, ?mode, %owner, "waiting for lock");
            while table.conflicts(&scope, mode, owner) {
                self.shared.released.wait(&mut table);
            }
            if let Some(entry) = table.entries.get_mut(&scope) {
                entry.waiters -= 1;
            }
        }
        table.grant(&scope, mode, owner);
        drop(table);

        LockGuard {
            shared: Arc::clone(&self.shared),
            scope,
            mode,
            owner,
        }
    }

    /// Grants the lock only if it is free right now.
    pub fn try_acquire(&self, scope: LockScope, mode: LockMode, owner: LockOwner) -> Option<LockGuard> {
        let mut table = self.shared.table.lock();
        if table.conflicts(&scope, mode, owner) {
            return None;
        }
        table.grant(&scope, mode, owner);
        drop(table);

        Some(LockGuard {
            shared: Arc::clone(&self.shared),
            scope,
            mode,
            owner,
        })
    }

    /// Number of outstanding grants, counting re-entrant ones separately.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.shared
            .table
            .lock()
            .entries
            .values()
            .flat_map(|e| e.holders.iter())
            .map(|h| h.count)
            .sum()
    }

    /// Number of live table entries.
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.shared.table.lock().entries.len()
    }
}

/// A granted lock. Released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    shared: Arc<Shared>,
    scope: LockScope,
    mode: LockMode,
    owner: LockOwner,
}

impl LockGuard {
    /// The locked scope.
    #[must_use]
    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// The lock mode.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// The owner holding the lock.
    #[must_use]
    pub fn owner(&self) -> LockOwner {
        self.owner
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.shared
            .table
            .lock()
            .release(&self.scope, self.mode, self.owner);
        self.shared.released.notify_all();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const BLOCKED: Duration = Duration::from_millis(100);
    const GRANTED: Duration = Duration::from_secs(5);

    fn field(key: &str, record: u64) -> LockScope {
        LockScope::Field(key.to_string(), RecordId::new(record))
    }

    /// Runs `acquire` on another thread and reports when it returns.
    fn spawn_acquire<F>(acquire: F) -> (mpsc::Receiver<()>, thread::JoinHandle<()>)
    where
        F: FnOnce() -> LockGuard + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _guard = acquire();
            tx.send(()).unwrap();
        });
        (rx, handle)
    }

    #[test]
    fn guard_release_empties_table() {
        let locks = LockManager::new();
        {
            let _a = locks.lock_and_isolate("a", RecordId::new(1));
            let _b = locks.lock_and_share_record(RecordId::new(2));
            assert_eq!(locks.held_count(), 2);
            assert_eq!(locks.table_size(), 2);
        }
        assert_eq!(locks.held_count(), 0);
        assert_eq!(locks.table_size(), 0);
    }

    #[test]
    fn shared_locks_coexist() {
        let locks = LockManager::new();
        let _a = locks.lock_and_share("a", RecordId::new(1));
        let _b = locks.lock_and_share_record(RecordId::new(1));
        let _c = locks.lock_and_share_key("a");
        assert_eq!(locks.held_count(), 3);
    }

    #[test]
    fn identical_isolate_scopes_are_exclusive() {
        let locks = LockManager::new();
        let first = locks.lock_and_isolate("a", RecordId::new(1));

        let other = locks.clone();
        let (granted, handle) = spawn_acquire(move || other.lock_and_isolate("a", RecordId::new(1)));
        assert!(granted.recv_timeout(BLOCKED).is_err());

        drop(first);
        granted.recv_timeout(GRANTED).unwrap();
        handle.join().unwrap();
        assert_eq!(locks.table_size(), 0);
    }

    #[test]
    fn record_share_waits_for_field_isolate() {
        let locks = LockManager::new();
        let isolate = locks.lock_and_isolate("a", RecordId::new(1));

        let other = locks.clone();
        let (granted, handle) = spawn_acquire(move || other.lock_and_share_record(RecordId::new(1)));
        assert!(granted.recv_timeout(BLOCKED).is_err());

        // unrelated record is not blocked
        let _free = locks.lock_and_share_record(RecordId::new(2));

        drop(isolate);
        granted.recv_timeout(GRANTED).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn field_isolate_waits_for_record_share() {
        let locks = LockManager::new();
        let share = locks.lock_and_share_record(RecordId::new(1));

        let other = locks.clone();
        let (granted, handle) = spawn_acquire(move || other.lock_and_isolate("a", RecordId::new(1)));
        assert!(granted.recv_timeout(BLOCKED).is_err());

        drop(share);
        granted.recv_timeout(GRANTED).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn key_share_waits_for_field_isolate_in_any_record() {
        let locks = LockManager::new();
        let isolate = locks.lock_and_isolate("a", RecordId::new(7));

        let other = locks.clone();
        let (granted, handle) = spawn_acquire(move || other.lock_and_share_key("a"));
        assert!(granted.recv_timeout(BLOCKED).is_err());
        let _unrelated = locks.lock_and_share_key("b");

        drop(isolate);
        granted.recv_timeout(GRANTED).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn different_fields_do_not_block() {
        let locks = LockManager::new();
        let _a = locks.lock_and_isolate("a", RecordId::new(1));
        let owner = locks.new_owner();
        assert!(locks
            .try_acquire(field("b", 1), LockMode::Isolated, owner)
            .is_some());
        assert!(locks
            .try_acquire(field("a", 2), LockMode::Isolated, owner)
            .is_some());
        assert!(locks
            .try_acquire(field("a", 1), LockMode::Shared, owner)
            .is_none());
    }

    #[test]
    fn same_owner_is_reentrant() {
        let locks = LockManager::new();
        let owner = locks.new_owner();

        let share = locks.acquire(LockScope::Record(RecordId::new(1)), LockMode::Shared, owner);
        let isolate = locks.acquire(field("a", 1), LockMode::Isolated, owner);
        let again = locks.acquire(field("a", 1), LockMode::Isolated, owner);
        assert_eq!(locks.held_count(), 3);

        let stranger = locks.new_owner();
        assert!(locks
            .try_acquire(field("a", 1), LockMode::Shared, stranger)
            .is_none());

        drop(again);
        assert!(locks
            .try_acquire(field("a", 1), LockMode::Shared, stranger)
            .is_none());
        drop(isolate);
        drop(share);
        assert!(locks
            .try_acquire(field("a", 1), LockMode::Shared, stranger)
            .is_some());
    }

    #[test]
    fn anonymous_callers_get_distinct_owners() {
        let locks = LockManager::new();
        let a = locks.lock_and_share("a", RecordId::new(1));
        let b = locks.lock_and_share("a", RecordId::new(1));
        assert_ne!(a.owner(), b.owner());
        assert_eq!(a.mode(), LockMode::Shared);
        assert_eq!(a.scope(), &field("a", 1));
    }

    #[test]
    fn waiter_keeps_entry_alive() {
        let locks = LockManager::new();
        let holder = locks.lock_and_share_record(RecordId::new(1));

        let other = locks.clone();
        let (granted, handle) = spawn_acquire(move || other.lock_and_isolate("a", RecordId::new(1)));
        assert!(granted.recv_timeout(BLOCKED).is_err());
        // record entry plus the waiter's field entry
        assert_eq!(locks.table_size(), 2);

        drop(holder);
        granted.recv_timeout(GRANTED).unwrap();
        handle.join().unwrap();
        assert_eq!(locks.table_size(), 0);
    }

    #[test]
    fn contended_isolation_is_mutually_exclusive() {
        use std::sync::atomic::AtomicUsize;

        let locks = LockManager::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = locks.lock_and_isolate("a", RecordId::new(1));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.held_count(), 0);
    }
}
