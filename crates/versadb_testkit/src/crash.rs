//! Crash recovery testing for VersaDB.
//!
//! Simulates a process dying at various points of the write path and checks
//! what the next open finds.
//!
//! ## Test Strategy
//!
//! 1. **Torn buffer tail** - the last staged write was cut mid-frame
//! 2. **Crash during append** - the backend dies part way through a write
//! 3. **Crash mid-commit** - a sealed transaction backup was left behind
//! 4. **Crash before seal** - an unsealed backup was left behind
//! 5. **Clean restart** - accepted writes survive in both tiers
//! 6. **Crash mid-transport** - a batch reached the database but its
//!    transport marker never made it to the buffer log
//! 7. **Opposing writes replay** - a backup that adds and removes the same
//!    value is replayed after both writes already landed
//!
//! ## Usage
//!
//! ```rust
//! use versadb_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new();
//! let results = harness.run_all();
//! assert!(results.iter().all(|r| r.passed), "{results:?}");
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use versadb_core::{
    Backup, CoreError, CoreResult, Engine, RecordId, TransactionId, Transactional, Value,
    Version, Write,
};
use versadb_storage::{StorageBackend, StorageError, StorageResult};

use crate::fixtures::{test_config, SharedDisks};

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected values after recovery.
    pub expected_values: usize,
    /// Actual values after recovery.
    pub actual_values: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, values: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_values: values,
            actual_values: values,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_values: expected,
            actual_values: actual,
            error: Some(error.to_string()),
        }
    }

    fn check(description: &str, expected: usize, actual: usize) -> Self {
        if expected == actual {
            Self::pass(description, actual)
        } else {
            Self::fail(description, expected, actual, "value count mismatch")
        }
    }
}

#[derive(Debug)]
struct CrashState {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
}

/// Remote control for a [`CrashableBackend`] that has been handed to an
/// engine.
#[derive(Debug, Clone)]
pub struct CrashSwitch {
    state: Arc<CrashState>,
}

impl CrashSwitch {
    /// Crashes once `bytes` more bytes have been appended.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        self.state
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }
}

/// A storage backend wrapper that can simulate a process dying mid-write.
///
/// Once crashed, every mutating call fails: nothing can clean up after a
/// dead process, so whatever partial bytes made it out stay there.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<CrashState>,
}

impl CrashableBackend {
    /// Wraps `inner` and returns the backend with its switch.
    pub fn new(inner: Box<dyn StorageBackend>) -> (Self, CrashSwitch) {
        let state = Arc::new(CrashState {
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
        });
        let switch = CrashSwitch {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, switch)
    }

    fn dead(&self, during: &str) -> StorageResult<()> {
        if self.state.crashed.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "simulated crash: {during} after process death"
            ))));
        }
        Ok(())
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.dead("append")?;
        let current = self.state.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        let threshold = self.state.crash_after_bytes.load(Ordering::SeqCst);

        if current + data.len() > threshold {
            self.state.crashed.store(true, Ordering::SeqCst);
            let partial_len = threshold.saturating_sub(current);
            if partial_len > 0 {
                let _ = self.inner.append(&data[..partial_len]);
            }
            return Err(StorageError::Io(std::io::Error::other(
                "simulated crash during write",
            )));
        }

        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.dead("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.dead("sync")?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.dead("truncate")?;
        self.inner.truncate(new_size)
    }
}

/// Test harness for crash recovery scenarios.
#[derive(Debug, Default)]
pub struct CrashRecoveryHarness {
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new crash recovery harness.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, description: &str, expected: usize, run: CoreResult<usize>) -> CrashRecoveryResult {
        let result = match run {
            Ok(actual) => CrashRecoveryResult::check(description, expected, actual),
            Err(e) => CrashRecoveryResult::fail(description, expected, 0, &e.to_string()),
        };
        self.results.push(result.clone());
        result
    }

    /// A staged write cut mid-frame is discarded; the ones before it stay.
    pub fn test_torn_buffer_tail(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let disks = SharedDisks::new();
            {
                let engine = disks.open();
                for name in ["Bob", "Ann", "Eve"] {
                    engine.add("name", name, RecordId::new(1))?;
                }
            }
            let mut bytes = disks.buffer.data();
            bytes.truncate(bytes.len() - 5);
            disks.buffer.replace(bytes);

            let engine = disks.open();
            let survivors = engine.fetch("name", RecordId::new(1)).len();
            // The log must take new frames after the cut.
            engine.add("name", "Eve", RecordId::new(1))?;
            drop(engine);
            Ok(survivors + disks.open().fetch("name", RecordId::new(1)).len())
        };
        let result = run();
        self.record("Torn buffer tail is discarded", 2 + 3, result)
    }

    /// A write that dies mid-append is not acknowledged and not recovered.
    pub fn test_crash_during_append(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let disks = SharedDisks::new();
            let (buffer, switch) = CrashableBackend::new(Box::new(disks.buffer.clone()));
            let engine = Engine::open_with_backends(
                test_config(),
                Box::new(buffer),
                Box::new(disks.database.clone()),
            )?;
            engine.add("name", "Bob", RecordId::new(1))?;
            switch.crash_after(7);
            if engine.add("name", "Ann", RecordId::new(1)).is_ok() || !switch.has_crashed() {
                return Err(CoreError::invalid_operation("write survived the crash"));
            }
            if engine.verify("name", &Value::from("Ann"), RecordId::new(1)) {
                return Err(CoreError::invalid_operation("failed write is visible"));
            }
            drop(engine);

            Ok(disks.open().fetch("name", RecordId::new(1)).len())
        };
        let result = run();
        self.record("Crash during append loses only that write", 1, result)
    }

    /// A sealed backup left by a commit that died part way is finished on
    /// open, and the writes that already landed are not applied twice.
    pub fn test_crash_mid_commit(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let temp = TempDir::new()?;
            {
                let engine = Engine::open_with_config(temp.path(), test_config())?;
                engine.add("tag", "a", RecordId::new(1))?;
            }
            let writes: Vec<Write> = ["a", "b", "c"]
                .into_iter()
                .enumerate()
                .map(|(i, tag)| {
                    Write::add("tag", tag, RecordId::new(1)).stamped(Version::new(i as u64 + 1))
                })
                .collect();
            let path = temp.path().join("txn").join("5.bak");
            Backup::write(&path, TransactionId::new(5), &writes)?;

            let engine = Engine::open_with_config(temp.path(), test_config())?;
            let stats = engine.stats();
            if stats.duplicates != 1 || stats.backups_replayed != 1 || path.exists() {
                return Err(CoreError::invalid_operation(format!(
                    "unexpected replay outcome: {stats:?}"
                )));
            }
            Ok(engine.fetch("tag", RecordId::new(1)).len())
        };
        let result = run();
        self.record("Sealed backup is replayed exactly once", 3, result)
    }

    /// A backup that was never sealed is thrown away.
    pub fn test_crash_before_seal(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let temp = TempDir::new()?;
            {
                let _engine = Engine::open_with_config(temp.path(), test_config())?;
            }
            let path = temp.path().join("txn").join("8.bak");
            let writes = [Write::add("tag", "x", RecordId::new(1)).stamped(Version::new(1))];
            Backup::write(&path, TransactionId::new(8), &writes)?;
            let bytes = std::fs::read(&path)?;
            std::fs::write(&path, &bytes[..bytes.len() - 3])?;

            let engine = Engine::open_with_config(temp.path(), test_config())?;
            if path.exists() {
                return Err(CoreError::invalid_operation("unsealed backup left in place"));
            }
            Ok(engine.fetch("tag", RecordId::new(1)).len())
        };
        let result = run();
        self.record("Unsealed backup is discarded", 0, result)
    }

    /// Accepted writes survive a restart whether or not they were
    /// transported.
    pub fn test_clean_restart(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let temp = TempDir::new()?;
            {
                let engine = Engine::open_with_config(temp.path(), test_config())?;
                for i in 0..10 {
                    engine.add("n", i, RecordId::new(1))?;
                    if i == 4 {
                        engine.transport_all()?;
                    }
                }
                engine.shutdown()?;
            }
            let engine = Engine::open_with_config(temp.path(), test_config())?;
            Ok(engine.fetch("n", RecordId::new(1)).len())
        };
        let result = run();
        self.record("Accepted writes survive restart", 10, result)
    }

    /// A batch applied to the database whose transport marker was lost is
    /// neither shown twice nor applied twice when it is transported again.
    pub fn test_crash_mid_transport(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let disks = SharedDisks::new();
            let record = RecordId::new(1);
            let (buffer, switch) = CrashableBackend::new(Box::new(disks.buffer.clone()));
            {
                let engine = Engine::open_with_backends(
                    test_config(),
                    Box::new(buffer),
                    Box::new(disks.database.clone()),
                )?;
                engine.add("f", true, record)?;
                engine.remove("f", true, record)?;
                engine.add("f", true, record)?;
                switch.crash_after(0);
                if engine.transport_all().is_ok() || !switch.has_crashed() {
                    return Err(CoreError::invalid_operation("transport marker survived the crash"));
                }
            }

            let engine = disks.open();
            let stats = engine.stats();
            if stats.pending != 3 || stats.revisions != 3 {
                return Err(CoreError::invalid_operation(format!(
                    "batch not in both tiers after restart: {stats:?}"
                )));
            }
            let before = engine.audit("f", record).len();
            if before != 3 || engine.fetch("f", record) != vec![Value::Bool(true)] {
                return Err(CoreError::invalid_operation(format!(
                    "reads show {before} revisions before transport"
                )));
            }
            engine.transport_all()?;
            if engine.stats().revisions != 3 {
                return Err(CoreError::invalid_operation("batch applied twice"));
            }
            Ok(engine.audit("f", record).len())
        };
        let result = run();
        self.record("Lost transport marker applies nothing twice", 3, result)
    }

    /// A backup holding an add and a remove of the same value, both already
    /// applied, changes nothing when replayed.
    pub fn test_opposing_writes_replay(&mut self) -> CrashRecoveryResult {
        let run = || -> CoreResult<usize> {
            let temp = TempDir::new()?;
            let record = RecordId::new(1);
            let landed = {
                let engine = Engine::open_with_config(temp.path(), test_config())?;
                let mut txn = engine.start_transaction()?;
                txn.add("name", "Bob", record)?;
                txn.remove("name", "Bob", record)?;
                txn.commit()?;
                let landed = engine.audit("name", record);
                engine.shutdown()?;
                landed
            };
            let writes: Vec<Write> = landed
                .iter()
                .zip([Write::add("name", "Bob", record), Write::remove("name", "Bob", record)])
                .map(|(revision, write)| write.stamped(revision.version))
                .collect();
            Backup::write(
                &temp.path().join("txn").join("3.bak"),
                TransactionId::new(3),
                &writes,
            )?;

            let engine = Engine::open_with_config(temp.path(), test_config())?;
            let stats = engine.stats();
            if stats.accepted != 0 || stats.duplicates != 2 || stats.backups_replayed != 1 {
                return Err(CoreError::invalid_operation(format!(
                    "unexpected replay outcome: {stats:?}"
                )));
            }
            if !engine.fetch("name", record).is_empty() {
                return Err(CoreError::invalid_operation("removed value came back"));
            }
            Ok(engine.audit("name", record).len())
        };
        let result = run();
        self.record("Opposing writes in a backup replay once", 2, result)
    }

    /// Runs every scenario.
    pub fn run_all(&mut self) -> Vec<CrashRecoveryResult> {
        vec![
            self.test_torn_buffer_tail(),
            self.test_crash_during_append(),
            self.test_crash_mid_commit(),
            self.test_crash_before_seal(),
            self.test_clean_restart(),
            self.test_crash_mid_transport(),
            self.test_opposing_writes_replay(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_passed(result: &CrashRecoveryResult) {
        assert!(result.passed, "{result:?}");
    }

    #[test]
    fn test_torn_buffer_tail() {
        assert_passed(&CrashRecoveryHarness::new().test_torn_buffer_tail());
    }

    #[test]
    fn test_crash_during_append() {
        assert_passed(&CrashRecoveryHarness::new().test_crash_during_append());
    }

    #[test]
    fn test_crash_mid_commit() {
        assert_passed(&CrashRecoveryHarness::new().test_crash_mid_commit());
    }

    #[test]
    fn test_crash_before_seal() {
        assert_passed(&CrashRecoveryHarness::new().test_crash_before_seal());
    }

    #[test]
    fn test_clean_restart() {
        assert_passed(&CrashRecoveryHarness::new().test_clean_restart());
    }

    #[test]
    fn test_crash_mid_transport() {
        assert_passed(&CrashRecoveryHarness::new().test_crash_mid_transport());
    }

    #[test]
    fn test_opposing_writes_replay() {
        assert_passed(&CrashRecoveryHarness::new().test_opposing_writes_replay());
    }

    #[test]
    fn test_run_all_passes() {
        let results = CrashRecoveryHarness::new().run_all();
        assert_eq!(results.len(), 7);
        results.iter().for_each(assert_passed);
    }

    #[test]
    fn test_switch_stays_quiet_until_armed() {
        let (mut backend, switch) = CrashableBackend::new(Box::new(
            versadb_storage::InMemoryBackend::new(),
        ));
        backend.append(b"abc").unwrap();
        assert!(!switch.has_crashed());

        switch.crash_after(2);
        assert!(backend.append(b"defg").is_err());
        assert!(switch.has_crashed());
        assert_eq!(backend.size().unwrap(), 5);
        assert!(backend.truncate(3).is_err());
    }
}
