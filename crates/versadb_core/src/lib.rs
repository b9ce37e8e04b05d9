//! # VersaDB Core
//!
//! The write path of VersaDB, a versioned key/value/record store.
//!
//! Every change is a [`Write`]: add or remove one value for a key in a
//! record. Writes enter a two-tier pipeline. They are staged in a durable
//! [`Buffer`] first and later transported into the indexed [`Database`],
//! where each one becomes an immutable [`Revision`]. Reads always see both
//! tiers.
//!
//! On top of the pipeline sit:
//! - a [`LockManager`] handing out shared and isolated locks over records,
//!   keys and fields
//! - [`Transaction`]s that stage writes locally and apply them as one unit
//! - the [`Engine`], which owns everything and runs an ordered, draining
//!   shutdown
//!
//! ## Example
//!
//! ```rust
//! use versadb_core::{Config, Engine, RecordId, Transactional, Value};
//!
//! let engine = Engine::open_in_memory_with_config(
//!     Config::default().background_transport(false),
//! )
//! .unwrap();
//!
//! let mut txn = engine.start_transaction().unwrap();
//! txn.add("name", "Bob", RecordId::new(42)).unwrap();
//! txn.add("age", 30, RecordId::new(42)).unwrap();
//! txn.commit().unwrap();
//!
//! assert!(engine.verify("name", &Value::from("Bob"), RecordId::new(42)));
//! assert_eq!(engine.describe(RecordId::new(42)).len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod clock;
mod config;
mod database;
mod dir;
mod engine;
mod error;
mod lock;
mod log;
mod scheduler;
mod service;
mod stats;
mod traits;
mod transaction;
mod types;
mod value;
mod write;

pub use buffer::{Buffer, BufferScan, BufferedWrite};
pub use clock::Clock;
pub use config::Config;
pub use database::{Database, DatabaseScan};
pub use dir::EngineDir;
pub use engine::{Engine, EngineState, ShutdownReport};
pub use error::{CoreError, CoreResult};
pub use lock::{LockGuard, LockManager, LockMode, LockOwner, LockScope};
pub use log::{Frame, FrameIterator, FramedLog, LogFormat, ReplaySummary, FRAME_VERSION};
pub use scheduler::{DroppedTask, SchedulerStats, TaskContext, TaskScheduler};
pub use service::{BufferingService, PipelineGuard};
pub use stats::{EngineStats, StatsSnapshot};
pub use traits::{Destination, Transactional};
pub use transaction::{Backup, CommitReceipt, Transaction, TransactionState};
pub use types::{RecordId, TransactionId, Version};
pub use value::Value;
pub use write::{Action, Revision, Write, WriteKind};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
