use crate::event::transaction::Transaction;
use crate::runtime::completion::{AwaitOutcome, CompletionHandle, TaskFailure};
use crate::runtime::executor::StreamExecutor;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How long the awaiter blocks on an empty hand-off queue before re-checking
/// the producer's done flag.
const AWAITER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning for one replay run.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    /// Bounded hand-off depth; at most this many transactions are in flight.
    pub replay_buffer: usize,
    /// Per-transaction consumption deadline.
    pub consume_timeout: Duration,
    /// Overall deadline for draining the hand-off queue after the journal
    /// iterator is exhausted. `None` waits indefinitely.
    pub max_replay_wait: Option<Duration>,
}

/// Errors terminating a replay run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("consumer failed during replay of stream {stream_id} revision {revision}: {message}")]
    Consumer {
        stream_id: String,
        revision: u64,
        message: String,
    },
    #[error("consumer did not finish stream {stream_id} revision {revision} within {timeout_ms} ms")]
    ConsumerHang {
        stream_id: String,
        revision: u64,
        timeout_ms: u64,
    },
    #[error("replay consumption did not finish within {wait_ms} ms")]
    Timeout { wait_ms: u64 },
    #[error("executor rejected replay work for stream {stream_id}: {reason}")]
    Dispatch { stream_id: String, reason: String },
}

struct HandoffState<T> {
    items: VecDeque<T>,
    in_use: usize,
    closed: bool,
}

/// Classic bounded producer/consumer hand-off. A slot stays occupied from the
/// producer's reservation until the awaiter has finished with the entry, so
/// submitted-but-unawaited transactions never exceed the capacity.
struct HandoffQueue<T> {
    capacity: usize,
    state: Mutex<HandoffState<T>>,
    space: Condvar,
    items: Condvar,
}

impl<T> HandoffQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(HandoffState {
                items: VecDeque::new(),
                in_use: 0,
                closed: false,
            }),
            space: Condvar::new(),
            items: Condvar::new(),
        }
    }

    /// Blocks until a slot is free. Returns false when the queue was closed.
    fn reserve(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return false;
            }
            if state.in_use < self.capacity {
                state.in_use += 1;
                return true;
            }
            state = self.space.wait(state).unwrap();
        }
    }

    /// Frees a slot: either an abandoned reservation or a finished entry.
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_use = state.in_use.saturating_sub(1);
        self.space.notify_one();
    }

    /// Converts a reservation into a queued item; the slot stays occupied.
    fn fill(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        self.items.notify_one();
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.pop_front() {
            return Some(item);
        }
        if state.closed {
            return None;
        }
        let (mut state, _) = self.items.wait_timeout(state, timeout).unwrap();
        state.items.pop_front()
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.items.is_empty() && state.in_use == 0
    }

    /// Unblocks the producer after an awaiter failure.
    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.space.notify_all();
        self.items.notify_all();
    }
}

struct Latch {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut done = self.state.lock().unwrap();
        *done = true;
        self.cv.notify_all();
    }

    /// Returns false on timeout.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.state.lock().unwrap();
        match timeout {
            None => {
                while !*done {
                    done = self.cv.wait(done).unwrap();
                }
                true
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*done {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self.cv.wait_timeout(done, deadline - now).unwrap();
                    done = next;
                }
                true
            }
        }
    }
}

/// Drives a cold journal iterator through the partitioned executor.
///
/// The calling thread produces: it submits each transaction's consumption and
/// parks the completion handle on the bounded hand-off queue, blocking when
/// `replay_buffer` submissions are in flight. A dedicated awaiter thread
/// drains the queue, holding each handle to the per-transaction deadline. The
/// first failed or hung handle halts the run.
///
/// Returns the maximum timestamp observed, or `None` for an empty journal.
pub fn run_replay<E, I, C>(
    transactions: I,
    executor: &StreamExecutor,
    consume: C,
    settings: &ReplaySettings,
) -> Result<Option<u64>, ReplayError>
where
    E: Send + 'static,
    I: Iterator<Item = Transaction<E>>,
    C: Fn(Transaction<E>) -> Result<(), TaskFailure> + Send + Sync + 'static,
{
    let consume = Arc::new(consume);
    let handoff: Arc<HandoffQueue<(String, u64, CompletionHandle)>> =
        Arc::new(HandoffQueue::new(settings.replay_buffer));
    let done_reading = Arc::new(AtomicBool::new(false));
    let latch = Arc::new(Latch::new());
    let error_slot: Arc<Mutex<Option<ReplayError>>> = Arc::new(Mutex::new(None));

    let awaiter = {
        let handoff = handoff.clone();
        let done_reading = done_reading.clone();
        let latch = latch.clone();
        let error_slot = error_slot.clone();
        let consume_timeout = settings.consume_timeout;
        thread::Builder::new()
            .name(format!("{}_replay_awaiter", executor.name()))
            .spawn(move || {
                loop {
                    match handoff.poll(AWAITER_POLL_INTERVAL) {
                        Some((stream_id, revision, handle)) => {
                            let outcome = handle.await_done(consume_timeout);
                            handoff.release();
                            match outcome {
                                AwaitOutcome::Completed => {}
                                AwaitOutcome::Failed(failure) => {
                                    *error_slot.lock().unwrap() = Some(ReplayError::Consumer {
                                        stream_id,
                                        revision,
                                        message: failure.message,
                                    });
                                    handoff.close();
                                    break;
                                }
                                AwaitOutcome::TimedOut => {
                                    *error_slot.lock().unwrap() = Some(ReplayError::ConsumerHang {
                                        stream_id,
                                        revision,
                                        timeout_ms: consume_timeout.as_millis() as u64,
                                    });
                                    handoff.close();
                                    break;
                                }
                            }
                        }
                        None => {
                            if done_reading.load(Ordering::Acquire) && handoff.is_drained() {
                                break;
                            }
                        }
                    }
                }
                latch.count_down();
            })
            .expect("failed to spawn replay awaiter")
    };

    let mut last_timestamp: Option<u64> = None;
    let mut produce_error: Option<ReplayError> = None;
    for txn in transactions {
        if !handoff.reserve() {
            break;
        }
        last_timestamp = Some(last_timestamp.map_or(txn.timestamp_ms, |ts| ts.max(txn.timestamp_ms)));
        let stream_id = txn.stream_id.clone();
        let revision = txn.revision;
        let job_consume = consume.clone();
        match executor.submit(&stream_id, move || job_consume(txn)) {
            Ok(handle) => handoff.fill((stream_id, revision, handle)),
            Err(err) => {
                handoff.release();
                produce_error = Some(ReplayError::Dispatch {
                    stream_id,
                    reason: err.to_string(),
                });
                break;
            }
        }
    }

    done_reading.store(true, Ordering::Release);
    let drained = latch.wait(settings.max_replay_wait);
    if !drained {
        // The awaiter keeps draining in the background; the run itself failed.
        return Err(ReplayError::Timeout {
            wait_ms: settings
                .max_replay_wait
                .map(|wait| wait.as_millis() as u64)
                .unwrap_or_default(),
        });
    }
    let _ = awaiter.join();

    if let Some(err) = error_slot.lock().unwrap().take() {
        return Err(err);
    }
    if let Some(err) = produce_error {
        return Err(err);
    }
    Ok(last_timestamp)
}
