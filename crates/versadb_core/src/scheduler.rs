//! Background task scheduler.
//!
//! A fixed pool of worker threads runs named tasks in FIFO order. The
//! engine uses it for periodic buffer transport. Shutdown is two-phase:
//! [`TaskScheduler::shutdown`] stops intake and asks periodic tasks to
//! finish, [`TaskScheduler::shutdown_now`] discards whatever is still
//! queued and flags running tasks as cancelled. Cancellation is
//! cooperative; a task observes it through its [`TaskContext`].

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Work = Box<dyn FnOnce(&TaskContext) + Send>;

struct Task {
    name: String,
    work: Work,
}

struct RunningTask {
    name: String,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Task>,
    running: HashMap<u64, RunningTask>,
    next_id: u64,
    accepting: bool,
    stopping: bool,
    live_workers: usize,
    completed: u64,
    panicked: u64,
}

struct Inner {
    state: Mutex<State>,
    work_ready: Condvar,
    changed: Condvar,
}

/// Handle given to a running task.
pub struct TaskContext {
    inner: Arc<Inner>,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    /// Whether [`TaskScheduler::shutdown_now`] cancelled this task.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the scheduler is shutting down or this task was cancelled.
    /// Periodic tasks return once this turns true.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.is_cancelled() || self.inner.state.lock().stopping
    }

    /// Sleeps for up to `duration`, waking early on shutdown.
    ///
    /// Returns `true` if the full duration elapsed and the task should keep
    /// going.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.inner.state.lock();
        while !state.stopping && !self.is_cancelled() {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return !state.stopping && !self.is_cancelled();
            }
        }
        false
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A task that did not run to completion because of [`TaskScheduler::shutdown_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedTask {
    /// The name given at submission.
    pub name: String,
    /// `true` if it had started and was flagged as cancelled, `false` if it
    /// never left the queue.
    pub was_running: bool,
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks currently executing.
    pub running: usize,
    /// Workers that have not exited.
    pub live_workers: usize,
    /// Tasks that returned normally.
    pub completed: u64,
    /// Tasks that panicked.
    pub panicked: u64,
}

/// A fixed-size worker pool.
pub struct TaskScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Starts `threads` workers named `{name}-{i}`.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(name: &str, threads: usize) -> CoreResult<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                accepting: true,
                ..State::default()
            }),
            work_ready: Condvar::new(),
            changed: Condvar::new(),
        });

        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker_inner = Arc::clone(&inner);
            inner.state.lock().live_workers += 1;
            let spawned = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&worker_inner));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    inner.state.lock().live_workers -= 1;
                    let scheduler = Self {
                        inner,
                        workers: Mutex::new(workers),
                    };
                    scheduler.shutdown();
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Queues `work` under `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::SchedulerShutdown`] once shutdown has begun.
    pub fn submit<F>(&self, name: impl Into<String>, work: F) -> CoreResult<()>
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.accepting {
            return Err(CoreError::SchedulerShutdown);
        }
        state.queue.push_back(Task {
            name: name.into(),
            work: Box::new(work),
        });
        drop(state);
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Stops intake. Queued tasks still run; periodic tasks see
    /// [`TaskContext::is_stopping`] and return. Does not wait.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.accepting = false;
        state.stopping = true;
        drop(state);
        self.inner.work_ready.notify_all();
        self.inner.changed.notify_all();
    }

    /// Waits up to `timeout` for every worker to exit.
    ///
    /// Returns `true` if the pool terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.live_workers > 0 {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                if state.live_workers > 0 {
                    return false;
                }
                break;
            }
        }
        drop(state);

        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("scheduler worker exited abnormally during shutdown");
            }
        }
        true
    }

    /// Discards queued tasks and cancels running ones.
    ///
    /// Returns every task that will not complete normally. Running tasks
    /// are only flagged; they stop when they next check their context.
    pub fn shutdown_now(&self) -> Vec<DroppedTask> {
        let mut state = self.inner.state.lock();
        state.accepting = false;
        state.stopping = true;

        let mut dropped: Vec<DroppedTask> = state
            .running
            .values()
            .map(|task| {
                task.cancelled.store(true, Ordering::Release);
                DroppedTask {
                    name: task.name.clone(),
                    was_running: true,
                }
            })
            .collect();
        dropped.extend(state.queue.drain(..).map(|task| DroppedTask {
            name: task.name,
            was_running: false,
        }));
        drop(state);

        self.inner.work_ready.notify_all();
        self.inner.changed.notify_all();
        dropped
    }

    /// Whether every worker has exited.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().live_workers == 0
    }

    /// Returns a counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            queued: state.queue.len(),
            running: state.running.len(),
            live_workers: state.live_workers,
            completed: state.completed,
            panicked: state.panicked,
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    loop {
        let (id, task, cancelled) = {
            let mut state = inner.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    let id = state.next_id;
                    state.next_id += 1;
                    let cancelled = Arc::new(AtomicBool::new(false));
                    state.running.insert(
                        id,
                        RunningTask {
                            name: task.name.clone(),
                            cancelled: Arc::clone(&cancelled),
                        },
                    );
                    break (id, task, cancelled);
                }
                if state.stopping {
                    state.live_workers -= 1;
                    drop(state);
                    inner.changed.notify_all();
                    return;
                }
                inner.work_ready.wait(&mut state);
            }
        };

        let context = TaskContext {
            inner: Arc::clone(inner),
            cancelled,
        };
        let Task { name, work } = task;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&context)));

        let mut state = inner.state.lock();
        state.running.remove(&id);
        match outcome {
            Ok(()) => state.completed += 1,
            Err(_) => {
                state.panicked += 1;
                tracing::error!(task = %name, "background task panicked");
            }
        }
        drop(state);
        inner.changed.notify_all();
    }
}
