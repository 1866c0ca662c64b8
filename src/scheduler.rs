//! Priority-ordered I/O worker pool
//!
//! Offloaded enumerator work (batched retrieval, async close, deferred
//! completions) is handed to an [`IoScheduler`]. The bundled
//! [`ThreadPoolScheduler`] keeps a single priority queue shared by a fixed
//! set of worker threads: a job with a lower priority value always runs
//! before any queued job with a higher value, and jobs of equal priority run
//! in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use once_cell::sync::Lazy;
use tracing::{debug, error, trace, warn};

use crate::cancellable::Cancellable;
use crate::error::EnumeratorResult;

pub const PRIORITY_HIGH: i32 = -100;
pub const PRIORITY_DEFAULT: i32 = 0;
pub const PRIORITY_LOW: i32 = 300;

/// Environment variable read by [`SchedulerConfig::from_env`].
pub const WORKER_THREADS_ENV: &str = "NPIO_IO_WORKER_THREADS";

/// A unit of offloaded work. It receives the cancellable it was submitted with.
pub type IoJob = Box<dyn FnOnce(Option<&Cancellable>) + Send + 'static>;

/// Executes offloaded jobs off the submitting thread.
pub trait IoScheduler: Send + Sync {
    /// Queues `job` to run at `priority` (lower value runs first).
    ///
    /// Implementations must run every accepted job exactly once and must
    /// never run it inside the call to `submit`.
    fn submit(&self, priority: i32, job: IoJob, cancellable: Option<Cancellable>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub worker_threads: usize,
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 10,
            thread_name: "npio-io".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults, with the worker count taken from `NPIO_IO_WORKER_THREADS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(WORKER_THREADS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.worker_threads = n,
                _ => warn!(
                    value = %raw,
                    default = config.worker_threads,
                    "ignoring invalid {}",
                    WORKER_THREADS_ENV
                ),
            }
        }
        config
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}

struct QueuedJob {
    priority: i32,
    seq: u64,
    job: IoJob,
    cancellable: Option<Cancellable>,
}

// BinaryHeap is a max-heap: the "greatest" job is the one with the lowest
// priority value, then the earliest submission.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

struct Queue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ThreadPoolScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolScheduler {
    pub fn new(config: SchedulerConfig) -> EnumeratorResult<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let count = config.worker_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }
        debug!(workers = count, name = %config.thread_name, "started I/O scheduler");

        Ok(Self { shared, workers })
    }

    /// Number of jobs waiting for a worker.
    pub fn queued_jobs(&self) -> usize {
        self.shared.lock().heap.len()
    }
}

impl IoScheduler for ThreadPoolScheduler {
    fn submit(&self, priority: i32, job: IoJob, cancellable: Option<Cancellable>) {
        let mut queue = self.shared.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedJob {
            priority,
            seq,
            job,
            cancellable,
        });
        trace!(priority, seq, "queued I/O job");
        drop(queue);
        self.shared.available.notify_one();
    }
}

impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last reference can be released from inside a job.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("I/O worker thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.lock();
            loop {
                // Drain whatever is queued before honoring shutdown.
                if let Some(job) = queue.heap.pop() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let QueuedJob {
            priority,
            seq,
            job,
            cancellable,
        } = next;
        trace!(priority, seq, "running I/O job");
        if panic::catch_unwind(AssertUnwindSafe(move || job(cancellable.as_ref()))).is_err() {
            error!(priority, seq, "I/O job panicked");
        }
    }
}

static DEFAULT_SCHEDULER: Lazy<Arc<ThreadPoolScheduler>> = Lazy::new(|| {
    let config = SchedulerConfig::from_env();
    match ThreadPoolScheduler::new(config) {
        Ok(scheduler) => Arc::new(scheduler),
        Err(e) => panic!("failed to start the default I/O scheduler: {}", e),
    }
});

/// The process-wide scheduler used by enumerators that were not given one.
///
/// # Panics
///
/// Panics on first use if no worker thread can be spawned.
pub fn default_scheduler() -> Arc<dyn IoScheduler> {
    DEFAULT_SCHEDULER.clone()
}
