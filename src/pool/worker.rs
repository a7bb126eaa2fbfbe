//! # Worker Pool
//!
//! [`WorkerPool`] is the bundled [`ThreadPool`](crate::pool::ThreadPool)
//! implementation: a fixed set of worker threads, each draining its own task
//! queue.
//!
//! ## Token pinning
//!
//! A task's [`GroupToken`] selects its worker (`token % workers`), so every
//! task carrying the same token runs on the same thread in submission order.
//! The dispatch engine uses one token per consumer, which turns this pinning
//! into a single-threaded apartment per consumer.
//!
//! ## Shutdown
//!
//! [`stop`](WorkerPool::stop) flips the stop flag, wakes all workers, and
//! joins them. Workers drain their queues before exiting, so every task
//! accepted by [`post`](WorkerPool::post) still runs. Submissions after the
//! flag flips are rejected. `stop` must not be called from a worker thread.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::pool::{GroupToken, PoolError, Task, ThreadPool};

/// Default thread name prefix.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "keyflow-worker";

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (minimum 1).
    pub workers: usize,

    /// Prefix for worker thread names (`<prefix>-<index>`).
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the specified worker count.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> WorkerPoolConfigBuilder {
        WorkerPoolConfigBuilder::default()
    }

    /// Returns the effective worker count (at least 1).
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }
}

/// Builder for [`WorkerPoolConfig`].
#[derive(Debug, Default)]
pub struct WorkerPoolConfigBuilder {
    workers: Option<usize>,
    thread_name_prefix: Option<String>,
}

impl WorkerPoolConfigBuilder {
    /// Sets the number of worker threads.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> WorkerPoolConfig {
        let defaults = WorkerPoolConfig::default();
        WorkerPoolConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            thread_name_prefix: self
                .thread_name_prefix
                .unwrap_or(defaults.thread_name_prefix),
        }
    }
}

/// Atomic counters for monitoring a [`WorkerPool`].
///
/// Observational only; not part of the dispatch behavior.
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    executed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerPoolMetrics {
    /// Returns the number of tasks that ran to completion (including ones
    /// that panicked).
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Returns the number of submissions rejected because the pool was
    /// stopping.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Returns the number of tasks whose panic was contained by a worker.
    #[must_use]
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

/// One worker's task queue plus its wake-up signal.
struct WorkerQueue {
    tasks: Mutex<VecDeque<Task>>,
    ready: Condvar,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }
}

/// Fixed-thread pool with per-token worker pinning.
///
/// See the [module docs](self) for the pinning and shutdown behavior.
pub struct WorkerPool {
    queues: Vec<Arc<WorkerQueue>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    metrics: Arc<WorkerPoolMetrics>,
}

impl WorkerPool {
    /// Creates a pool with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a worker thread cannot be spawned.
    pub fn new() -> Result<Self, PoolError> {
        Self::with_config(WorkerPoolConfig::default())
    }

    /// Creates a pool with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a worker thread cannot be spawned.
    pub fn with_config(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        let workers = config.effective_workers();
        let stopping = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(WorkerPoolMetrics::default());

        let queues: Vec<Arc<WorkerQueue>> =
            (0..workers).map(|_| Arc::new(WorkerQueue::new())).collect();

        let mut threads = Vec::with_capacity(workers);
        for (index, queue) in queues.iter().enumerate() {
            let queue = Arc::clone(queue);
            let stopping = Arc::clone(&stopping);
            let metrics = Arc::clone(&metrics);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name_prefix))
                .spawn(move || worker_loop(&queue, &stopping, &metrics))?;
            threads.push(handle);
        }

        Ok(Self {
            queues,
            threads: Mutex::new(threads),
            stopping,
            metrics,
        })
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Returns the number of tasks currently queued across all workers.
    #[must_use]
    pub fn queued_tasks(&self) -> usize {
        self.queues.iter().map(|q| q.tasks.lock().len()).sum()
    }

    /// Returns the pool's metrics counters.
    #[must_use]
    pub fn metrics(&self) -> &WorkerPoolMetrics {
        &self.metrics
    }

    /// Returns true if the pool is stopping or stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        for queue in &self.queues {
            queue.ready.notify_all();
        }

        // Never join the calling thread; a worker reaching here (last pool
        // handle dropped inside a task) detaches itself instead.
        let current = std::thread::current().id();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("worker thread terminated by panic");
            }
        }
    }
}

impl ThreadPool for WorkerPool {
    fn post(&self, task: Task, token: GroupToken) -> Result<(), PoolError> {
        if self.stopping.load(Ordering::Acquire) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Stopped);
        }

        let queue = &self.queues[token.0 % self.queues.len()];
        queue.tasks.lock().push_back(task);
        queue.ready.notify_one();
        Ok(())
    }

    fn stop(&self) {
        self.shutdown();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers())
            .field("queued_tasks", &self.queued_tasks())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Drains one worker's queue until the pool stops and the queue is empty.
fn worker_loop(queue: &WorkerQueue, stopping: &AtomicBool, metrics: &WorkerPoolMetrics) {
    loop {
        let task = {
            let mut tasks = queue.tasks.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break Some(task);
                }
                if stopping.load(Ordering::Acquire) {
                    break None;
                }
                queue.ready.wait(&mut tasks);
            }
        };

        let Some(task) = task else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            metrics.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("task panicked on worker thread; panic contained");
        }
        metrics.executed.fetch_add(1, Ordering::Relaxed);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
