use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type ScheduledJob = Box<dyn FnOnce() + Send>;

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Fresh handle, created before scheduling so callers can register it
    /// first and schedule only once registration succeeded.
    pub fn unscheduled() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: ScheduledJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct SchedulerState {
    queue: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    closed: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

/// Single-threaded delayed-task runner used for scheduled gap replays.
///
/// Tasks fire in due-time order on the scheduler thread; a zero delay fires on
/// the next tick. Cancelled tasks are discarded when they come due.
pub struct ReplayScheduler {
    shared: Arc<SchedulerShared>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReplayScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        });
        let loop_shared = shared.clone();
        let join = thread::Builder::new()
            .name(format!("{}_scheduler", name.into()))
            .spawn(move || Self::run(loop_shared))
            .expect("failed to spawn scheduler thread");
        Self {
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    fn run(shared: Arc<SchedulerShared>) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.closed {
                return;
            }
            let now = Instant::now();
            let next_due = state.queue.peek().map(|Reverse(entry)| entry.due);
            match next_due {
                None => {
                    state = shared.cv.wait(state).unwrap();
                }
                Some(due) if due > now => {
                    let (next, _) = shared.cv.wait_timeout(state, due - now).unwrap();
                    state = next;
                }
                Some(_) => {
                    let Reverse(entry) = state.queue.pop().unwrap();
                    if entry.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    drop(state);
                    (entry.job)();
                    state = shared.state.lock().unwrap();
                }
            }
        }
    }

    /// Schedules `job` to run after `delay`.
    pub fn schedule_after(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> TaskHandle {
        let handle = TaskHandle::unscheduled();
        self.schedule_with(&handle, delay, job);
        handle
    }

    /// Schedules `job` under a pre-created handle. Late submissions against a
    /// closed scheduler are dropped and the handle observes cancellation.
    pub fn schedule_with(
        &self,
        handle: &TaskHandle,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            handle.cancel();
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Reverse(Entry {
            due: Instant::now() + delay,
            seq,
            cancelled: handle.cancelled.clone(),
            job: Box::new(job),
        }));
        self.shared.cv.notify_one();
    }

    /// Pending (not yet fired, not yet collected) task count.
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Stops the scheduler thread and discards pending tasks. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplayScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
