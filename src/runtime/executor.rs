use crate::runtime::completion::{CompletionHandle, TaskFailure};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use thiserror::Error;

/// Deterministic 64-bit FNV-1a over the partition key. Stable across
/// toolchains so routing never depends on the process hasher seed.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Error returned when submitting to a stopped executor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("executor {name} is shut down")]
    Closed { name: String },
}

type Job = Box<dyn FnOnce() -> Result<(), TaskFailure> + Send>;

enum WorkerSignal {
    Work(Job, CompletionHandle),
    Shutdown,
}

struct WorkerQueue {
    state: Mutex<VecDeque<WorkerSignal>>,
    cv: Condvar,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, signal: WorkerSignal) {
        self.state.lock().unwrap().push_back(signal);
        self.cv.notify_one();
    }

    fn pop(&self) -> WorkerSignal {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(signal) = state.pop_front() {
                return signal;
            }
            state = self.cv.wait(state).unwrap();
        }
    }
}

/// Per-worker counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    processed: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl WorkerMetrics {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct Worker {
    queue: Arc<WorkerQueue>,
    metrics: WorkerMetrics,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Hash-partitioned serial executor.
///
/// `worker_count` queues, each drained by one worker thread in FIFO order. A
/// partition key always routes to the same queue, so work for one key runs
/// strictly serially while distinct keys proceed in parallel.
pub struct StreamExecutor {
    name: String,
    workers: Vec<Worker>,
    shutdown: AtomicBool,
}

impl StreamExecutor {
    /// Spawns `worker_count` workers named `{name}_worker_{index}`.
    pub fn new(name: impl Into<String>, worker_count: usize) -> Self {
        let name = name.into();
        let count = worker_count.max(1);
        let workers = (0..count)
            .map(|index| {
                let queue = Arc::new(WorkerQueue::new());
                let metrics = WorkerMetrics::default();
                let worker_queue = queue.clone();
                let worker_metrics = metrics.clone();
                let join = thread::Builder::new()
                    .name(format!("{name}_worker_{index}"))
                    .spawn(move || loop {
                        match worker_queue.pop() {
                            WorkerSignal::Work(job, handle) => {
                                let result = job();
                                if result.is_err() {
                                    worker_metrics.failures.fetch_add(1, Ordering::Relaxed);
                                }
                                worker_metrics.processed.fetch_add(1, Ordering::Relaxed);
                                handle.complete(result);
                            }
                            WorkerSignal::Shutdown => break,
                        }
                    })
                    .expect("failed to spawn executor worker");
                Worker {
                    queue,
                    metrics,
                    join: Mutex::new(Some(join)),
                }
            })
            .collect();
        Self {
            name,
            workers,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue index a partition key routes to.
    pub fn partition_for(&self, key: &str) -> usize {
        (hash_partition_key(key) % self.workers.len() as u64) as usize
    }

    /// Enqueues `job` on the key's queue and returns its completion handle.
    pub fn submit<F>(&self, partition_key: &str, job: F) -> Result<CompletionHandle, SubmitError>
    where
        F: FnOnce() -> Result<(), TaskFailure> + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::Closed {
                name: self.name.clone(),
            });
        }
        let handle = CompletionHandle::pending();
        let worker = &self.workers[self.partition_for(partition_key)];
        worker
            .queue
            .push(WorkerSignal::Work(Box::new(job), handle.clone()));
        Ok(handle)
    }

    pub fn metrics(&self, worker_index: usize) -> &WorkerMetrics {
        &self.workers[worker_index].metrics
    }

    /// Jobs processed across all workers.
    pub fn processed_total(&self) -> u64 {
        self.workers
            .iter()
            .map(|worker| worker.metrics.processed())
            .sum()
    }

    /// Stops accepting work, lets queued jobs finish, joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.workers {
            worker.queue.push(WorkerSignal::Shutdown);
        }
        for worker in &self.workers {
            if let Some(handle) = worker.join.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for StreamExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
