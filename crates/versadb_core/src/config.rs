//! Engine configuration.

use std::time::Duration;

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the engine directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the buffer log after every insert (safer but slower).
    pub sync_on_insert: bool,

    /// Whether a background task drains the buffer into the database.
    pub background_transport: bool,

    /// Pause between background transport passes.
    pub transport_interval: Duration,

    /// Maximum writes moved per pipeline acquisition.
    pub transport_batch_size: usize,

    /// Worker threads in the task scheduler.
    pub worker_threads: usize,

    /// How long shutdown waits for background tasks before cancelling them.
    pub shutdown_grace: Duration,

    /// Whether commits write a backup that is replayed after a crash.
    pub transaction_backups: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_insert: true,
            background_transport: true,
            transport_interval: Duration::from_millis(50),
            transport_batch_size: 256,
            worker_threads: 2,
            shutdown_grace: Duration::from_secs(60),
            transaction_backups: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the buffer log on every insert.
    #[must_use]
    pub const fn sync_on_insert(mut self, value: bool) -> Self {
        self.sync_on_insert = value;
        self
    }

    /// Sets whether the buffer is drained in the background.
    #[must_use]
    pub const fn background_transport(mut self, value: bool) -> Self {
        self.background_transport = value;
        self
    }

    /// Sets the pause between background transport passes.
    #[must_use]
    pub const fn transport_interval(mut self, interval: Duration) -> Self {
        self.transport_interval = interval;
        self
    }

    /// Sets the transport batch size. Zero is treated as one.
    #[must_use]
    pub const fn transport_batch_size(mut self, size: usize) -> Self {
        self.transport_batch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the number of scheduler workers. Zero is treated as one.
    #[must_use]
    pub const fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = if threads == 0 { 1 } else { threads };
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets whether commits are backed up.
    #[must_use]
    pub const fn transaction_backups(mut self, value: bool) -> Self {
        self.transaction_backups = value;
        self
    }
}
