use crate::event::source::{EventSource, SourceError, Subscription};
use crate::event::transaction::{CategoryFilter, Transaction};
use crossbeam_queue::ArrayQueue;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Default bound for each subscriber's live feed queue.
pub const LIVE_QUEUE_CAPACITY: usize = 1_024;

const DISPATCH_IDLE: Duration = Duration::from_millis(1);

/// Errors raised while appending to the in-memory journal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The `(stream_id, revision)` identity already exists. Callers append
    /// with the next revision and retry on this error.
    #[error("stream {stream_id} already holds revision {revision}")]
    DuplicateRevision { stream_id: String, revision: u64 },
}

struct JournalState<E> {
    entries: Vec<Transaction<E>>,
    identities: HashSet<(String, u64)>,
}

/// One live subscriber: a bounded lock-free feed drained by its dispatcher
/// thread. A saturated feed drops the push; the journal remains the source
/// of truth and scheduled range replays recover the loss.
struct LiveSubscriber<E> {
    filter: CategoryFilter,
    feed: ArrayQueue<Transaction<E>>,
    active: AtomicBool,
    dropped: AtomicU64,
}

struct MemorySubscription<E> {
    subscriber: Arc<LiveSubscriber<E>>,
}

impl<E: Send + 'static> Subscription for MemorySubscription<E> {
    fn cancel(&self) {
        self.subscriber.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::Acquire)
    }
}

struct StoreInner<E> {
    journal: Mutex<JournalState<E>>,
    subscribers: Mutex<Vec<Arc<LiveSubscriber<E>>>>,
    live_capacity: usize,
    dispatch_seq: AtomicUsize,
}

impl<E> Drop for StoreInner<E> {
    fn drop(&mut self) {
        // Release dispatcher threads of subscriptions nobody cancelled.
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber.active.store(false, Ordering::Release);
        }
    }
}

/// Non-persistent [`EventSource`] backing: a sorted in-memory journal plus
/// per-subscriber pub/sub fan-out.
pub struct MemoryEventStore<E> {
    inner: Arc<StoreInner<E>>,
}

impl<E> Clone for MemoryEventStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for MemoryEventStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> MemoryEventStore<E> {
    pub fn new() -> Self {
        Self::with_live_capacity(LIVE_QUEUE_CAPACITY)
    }

    /// Bounds each subscriber's live feed at `capacity` entries.
    pub fn with_live_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                journal: Mutex::new(JournalState {
                    entries: Vec::new(),
                    identities: HashSet::new(),
                }),
                subscribers: Mutex::new(Vec::new()),
                live_capacity: capacity.max(1),
                dispatch_seq: AtomicUsize::new(0),
            }),
        }
    }

    /// Transactions currently held by the journal.
    pub fn journal_len(&self) -> usize {
        self.inner.journal.lock().unwrap().entries.len()
    }

    /// Live pushes dropped across all subscribers because a feed was full.
    pub fn dropped_live_total(&self) -> u64 {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|subscriber| subscriber.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

impl<E: Clone + Send + Sync + 'static> MemoryEventStore<E> {
    /// Commits a transaction to the journal and fans it out to matching live
    /// subscribers.
    pub fn append(&self, txn: Transaction<E>) -> Result<(), StoreError> {
        {
            let mut journal = self.inner.journal.lock().unwrap();
            let identity = (txn.stream_id.clone(), txn.revision);
            if journal.identities.contains(&identity) {
                return Err(StoreError::DuplicateRevision {
                    stream_id: txn.stream_id.clone(),
                    revision: txn.revision,
                });
            }
            let key = txn.journal_key();
            let position = journal
                .entries
                .partition_point(|entry| entry.journal_key() < key);
            journal.entries.insert(position, txn.clone());
            journal.identities.insert(identity);
        }
        for subscriber in self.inner.subscribers.lock().unwrap().iter() {
            if !subscriber.active.load(Ordering::Acquire)
                || !subscriber.filter.matches(&txn.category)
            {
                continue;
            }
            if subscriber.feed.push(txn.clone()).is_err() {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn collect(
        &self,
        filter: impl Fn(&Transaction<E>) -> bool,
    ) -> Box<dyn Iterator<Item = Transaction<E>> + Send> {
        let journal = self.inner.journal.lock().unwrap();
        let matched: Vec<Transaction<E>> = journal
            .entries
            .iter()
            .filter(|entry| filter(entry))
            .cloned()
            .collect();
        Box::new(matched.into_iter())
    }
}

impl<E: Clone + Send + Sync + 'static> EventSource<E> for MemoryEventStore<E> {
    fn subscribe(
        &self,
        sink: Box<dyn Fn(Transaction<E>) + Send + Sync>,
        filter: CategoryFilter,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        let subscriber = Arc::new(LiveSubscriber {
            filter,
            feed: ArrayQueue::new(self.inner.live_capacity),
            active: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        });
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push(subscriber.clone());
        let dispatch = subscriber.clone();
        let index = self.inner.dispatch_seq.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("memstore_dispatch_{index}"))
            .spawn(move || loop {
                match dispatch.feed.pop() {
                    Some(txn) => sink(txn),
                    None => {
                        if !dispatch.active.load(Ordering::Acquire) {
                            break;
                        }
                        thread::sleep(DISPATCH_IDLE);
                    }
                }
            })
            .expect("failed to spawn subscription dispatcher");
        Ok(Box::new(MemorySubscription { subscriber }))
    }

    fn replay(
        &self,
        filter: &CategoryFilter,
    ) -> Result<Box<dyn Iterator<Item = Transaction<E>> + Send>, SourceError> {
        let filter = filter.clone();
        Ok(self.collect(move |entry| filter.matches(&entry.category)))
    }

    fn replay_from(
        &self,
        since_ms: u64,
        filter: &CategoryFilter,
    ) -> Result<Box<dyn Iterator<Item = Transaction<E>> + Send>, SourceError> {
        let filter = filter.clone();
        Ok(self.collect(move |entry| {
            entry.timestamp_ms >= since_ms && filter.matches(&entry.category)
        }))
    }

    fn replay_stream_range(
        &self,
        stream_id: &str,
        revisions: Range<u64>,
    ) -> Result<Box<dyn Iterator<Item = Transaction<E>> + Send>, SourceError> {
        if revisions.start > revisions.end {
            return Err(SourceError::InvalidRange {
                stream_id: stream_id.to_string(),
                lo: revisions.start,
                hi: revisions.end,
            });
        }
        let stream = stream_id.to_string();
        let mut matched: Vec<Transaction<E>> = {
            let journal = self.inner.journal.lock().unwrap();
            journal
                .entries
                .iter()
                .filter(|entry| entry.stream_id == stream && revisions.contains(&entry.revision))
                .cloned()
                .collect()
        };
        matched.sort_by_key(|entry| entry.revision);
        Ok(Box::new(matched.into_iter()))
    }
}
