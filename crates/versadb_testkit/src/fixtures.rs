//! Test fixtures and engine helpers.
//!
//! Provides convenience functions for setting up test engines and common
//! test scenarios.

use std::path::Path;
use tempfile::TempDir;
use versadb_core::{Config, Engine, RecordId, Transactional};
use versadb_storage::SharedMemoryBackend;

/// Configuration used by fixtures: no background transport, so tests decide
/// when writes move from the buffer into the database.
#[must_use]
pub fn test_config() -> Config {
    Config::default()
        .background_transport(false)
        .sync_on_insert(false)
}

/// A test engine with automatic cleanup.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Engine,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates a new in-memory test engine.
    pub fn memory() -> Self {
        Self::memory_with_config(test_config())
    }

    /// Creates a new in-memory test engine with `config`.
    pub fn memory_with_config(config: Config) -> Self {
        Self {
            engine: Engine::open_in_memory_with_config(config)
                .expect("Failed to open in-memory engine"),
            temp_dir: None,
        }
    }

    /// Creates a new engine in a temporary directory.
    pub fn file() -> Self {
        Self::file_with_config(test_config())
    }

    /// Creates a new engine in a temporary directory with `config`.
    pub fn file_with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let engine =
            Engine::open_with_config(temp_dir.path(), config).expect("Failed to open file engine");
        Self {
            engine,
            temp_dir: Some(temp_dir),
        }
    }

    /// Shuts the engine down and opens it again on the same directory.
    ///
    /// # Panics
    ///
    /// Panics for in-memory engines, which have nothing to reopen.
    pub fn reopen(self) -> Self {
        self.reopen_with_config(test_config())
    }

    /// Like [`Self::reopen`], with `config`.
    pub fn reopen_with_config(self, config: Config) -> Self {
        let Self { engine, temp_dir } = self;
        let temp_dir = temp_dir.expect("Only file engines can be reopened");
        engine.shutdown().expect("Failed to shut down engine");
        drop(engine);

        let engine =
            Engine::open_with_config(temp_dir.path(), config).expect("Failed to reopen engine");
        Self {
            engine,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the engine directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Two shared in-memory "disks" that outlive any engine opened on them.
///
/// Lets a test drop an engine, tamper with the bytes it left, and open a
/// new engine on what remains.
#[derive(Debug, Clone, Default)]
pub struct SharedDisks {
    /// Backing bytes of the buffer log.
    pub buffer: SharedMemoryBackend,
    /// Backing bytes of the revision log.
    pub database: SharedMemoryBackend,
}

impl SharedDisks {
    /// Creates two empty disks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an engine on these disks.
    pub fn open(&self) -> Engine {
        self.open_with_config(test_config())
    }

    /// Opens an engine on these disks with `config`.
    pub fn open_with_config(&self, config: Config) -> Engine {
        Engine::open_with_backends(
            config,
            Box::new(self.buffer.clone()),
            Box::new(self.database.clone()),
        )
        .expect("Failed to open engine on shared disks")
    }
}

/// Runs a test with a temporary in-memory engine.
///
/// # Example
///
/// ```rust
/// use versadb_core::RecordId;
/// use versadb_testkit::with_temp_engine;
///
/// with_temp_engine(|engine| {
///     engine.add("name", "Bob", RecordId::new(1)).unwrap();
///     assert_eq!(engine.fetch("name", RecordId::new(1)).len(), 1);
/// });
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine) -> R,
{
    let test_engine = TestEngine::memory();
    f(&test_engine.engine)
}

/// Runs a test with an engine in a temporary directory.
pub fn with_file_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine, &Path) -> R,
{
    let test_engine = TestEngine::file();
    let path = test_engine
        .path()
        .expect("File engine should have a path")
        .to_path_buf();
    f(&test_engine.engine, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates an engine where records `0..record_count` each hold
    /// `name = "user-<i>"` and `age = <i>`, committed one transaction per
    /// record.
    pub fn populated_engine(record_count: u64) -> TestEngine {
        let test_engine = TestEngine::memory();
        for i in 0..record_count {
            let record = RecordId::new(i);
            let mut txn = test_engine
                .start_transaction()
                .expect("Failed to start transaction");
            txn.add("name", format!("user-{i}"), record)
                .expect("Failed to stage name");
            txn.add("age", i as i64, record).expect("Failed to stage age");
            txn.commit().expect("Failed to commit");
        }
        test_engine
    }

    /// Like [`populated_engine`], with half the records already transported
    /// into the database and the rest still buffered.
    pub fn half_transported_engine(record_count: u64) -> TestEngine {
        let test_engine = TestEngine::memory();
        let half = record_count / 2;
        for i in 0..record_count {
            if i == half {
                test_engine.transport_all().expect("Failed to transport");
            }
            test_engine
                .add("name", format!("user-{i}"), RecordId::new(i))
                .expect("Failed to add");
        }
        test_engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versadb_core::Value;

    #[test]
    fn test_memory_engine() {
        let test_engine = TestEngine::memory();
        assert!(test_engine.path().is_none());
        assert!(test_engine.add("name", "Bob", RecordId::new(1)).unwrap());
    }

    #[test]
    fn test_file_engine_reopens() {
        let test_engine = TestEngine::file();
        assert!(test_engine.path().is_some());
        test_engine.add("name", "Bob", RecordId::new(1)).unwrap();

        let test_engine = test_engine.reopen();
        assert_eq!(
            test_engine.fetch("name", RecordId::new(1)),
            vec![Value::from("Bob")]
        );
    }

    #[test]
    fn test_shared_disks_survive_engine() {
        let disks = SharedDisks::new();
        {
            let engine = disks.open();
            engine.add("name", "Bob", RecordId::new(1)).unwrap();
        }
        assert!(!disks.buffer.data().is_empty());

        let engine = disks.open();
        assert!(engine.verify("name", &Value::from("Bob"), RecordId::new(1)));
    }

    #[test]
    fn test_with_file_engine() {
        with_file_engine(|engine, path| {
            assert_eq!(engine.path(), Some(path));
        });
    }

    #[test]
    fn test_populated_scenario() {
        let test_engine = scenarios::populated_engine(10);
        assert_eq!(test_engine.describe(RecordId::new(3)).len(), 2);
        assert_eq!(test_engine.stats().transactions_committed, 10);
    }

    #[test]
    fn test_half_transported_scenario() {
        let test_engine = scenarios::half_transported_engine(10);
        let stats = test_engine.stats();
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.revisions, 5);
        assert_eq!(
            test_engine.fetch("name", RecordId::new(7)),
            vec![Value::from("user-7")]
        );
    }
}
