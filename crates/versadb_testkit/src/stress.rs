//! Stress tests for VersaDB.
//!
//! These runners drive an engine under heavy load and concurrent access and
//! report what happened. They never assert themselves; the caller decides
//! what counts as a pass.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use versadb_core::{CoreError, Engine, RecordId, Transactional};

/// Result of a stress test run.
#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Operations that returned `Ok(true)` or committed.
    pub accepted_ops: usize,
    /// Operations that returned `Ok(false)`.
    pub rejected_ops: usize,
    /// Operations that returned an error.
    pub failed_ops: usize,
    /// Total duration.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(accepted: usize, rejected: usize, failed: usize, duration: Duration) -> Self {
        let total = accepted + rejected + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            accepted_ops: accepted,
            rejected_ops: rejected,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Renders the result as JSON, for collecting runs in CI.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Accepted: {}", self.accepted_ops);
        println!("Rejected: {}", self.rejected_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform (split across threads).
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct records.
    pub record_count: u64,
    /// Writes per transaction in transaction runs.
    pub batch_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            record_count: 64,
            batch_size: 16,
        }
    }
}

#[derive(Default)]
struct Tally {
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: Result<bool, CoreError>) {
        let counter = match outcome {
            Ok(true) => &self.accepted,
            Ok(false) => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, start: Instant) -> StressTestResult {
        StressTestResult::new(
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            start.elapsed(),
        )
    }
}

/// Run a sequential add stress test. Every write is distinct.
pub fn stress_sequential_adds(engine: &Engine, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();

    for i in 0..config.operations {
        let record = RecordId::new(i as u64 % config.record_count);
        tally.record(engine.add("seq", i as i64, record));
    }

    tally.finish(start)
}

/// Run a concurrent stress test where every thread toggles the same value
/// on the same fields.
///
/// Field isolation makes each add/remove pair observe its own effect, so
/// the number of accepted writes is always even and the final state has no
/// value left behind.
pub fn stress_contended_toggles(engine: Arc<Engine>, config: &StressConfig) -> StressTestResult {
    let tally = Arc::new(Tally::default());
    let per_thread = config.operations / config.threads.max(1);
    let record_count = config.record_count;
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let tally = Arc::clone(&tally);
            thread::spawn(move || {
                for i in 0..per_thread / 2 {
                    let record = RecordId::new(((t * per_thread + i) as u64) % record_count);
                    let mut txn = match engine.start_transaction() {
                        Ok(txn) => txn,
                        Err(e) => {
                            tally.record(Err(e));
                            continue;
                        }
                    };
                    tally.record(txn.add("flag", true, record));
                    tally.record(txn.remove("flag", true, record));
                    if let Err(e) = txn.commit() {
                        tally.record(Err(e));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    tally.finish(start)
}

/// Run a concurrent stress test where every thread writes its own values.
pub fn stress_concurrent_adds(engine: Arc<Engine>, config: &StressConfig) -> StressTestResult {
    let tally = Arc::new(Tally::default());
    let per_thread = config.operations / config.threads.max(1);
    let record_count = config.record_count;
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let tally = Arc::clone(&tally);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let record = RecordId::new(i as u64 % record_count);
                    tally.record(engine.add("owner", format!("t{t}-{i}"), record));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    tally.finish(start)
}

/// Run a transaction stress test where every other transaction aborts.
pub fn stress_transaction_aborts(engine: &Engine, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();

    for i in 0..config.operations {
        let record = RecordId::new(i as u64 % config.record_count);
        let should_fail = i % 2 == 0;

        let result = engine.transaction(|txn| {
            txn.add("attempt", i as i64, record)?;
            if should_fail {
                Err(CoreError::invalid_operation("intentional"))
            } else {
                Ok(true)
            }
        });
        tally.record(result);
    }

    tally.finish(start)
}

/// Run a large transaction stress test, `batch_size` writes per commit.
pub fn stress_large_transactions(engine: &Engine, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let batch_size = config.batch_size.max(1);
    let start = Instant::now();

    for batch in 0..(config.operations / batch_size) {
        let result = engine.transaction(|txn| {
            for i in 0..batch_size {
                let idx = batch * batch_size + i;
                txn.add("batch", idx as i64, RecordId::new(idx as u64 % config.record_count))?;
            }
            Ok(())
        });
        let counter = if result.is_ok() {
            &tally.accepted
        } else {
            &tally.failed
        };
        counter.fetch_add(batch_size, Ordering::Relaxed);
    }

    tally.finish(start)
}

/// Runs writers against `engine` while another thread shuts it down.
///
/// Every writer stops at its first error. Returns the tally and the number
/// of values found afterwards, which must equal the accepted count: a write
/// that was acknowledged is never lost, and a refused one never lands.
pub fn stress_shutdown_under_load(
    engine: Arc<Engine>,
    config: &StressConfig,
    shutdown_after: Duration,
) -> (StressTestResult, usize) {
    let tally = Arc::new(Tally::default());
    let per_thread = config.operations / config.threads.max(1);
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let tally = Arc::clone(&tally);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let outcome = engine.add("load", format!("t{t}-{i}"), RecordId::new(t as u64));
                    let stop = outcome.is_err();
                    tally.record(outcome);
                    if stop {
                        break;
                    }
                }
            })
        })
        .collect();

    thread::sleep(shutdown_after);
    let _ = engine.shutdown();
    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let stored = (0..config.threads)
        .map(|t| engine.fetch("load", RecordId::new(t as u64)).len())
        .sum();
    (tally.finish(start), stored)
}
