use sequentra::{
    CategoryFilter, ConsumerError, DurableConsumer, EventSource, EventStream, EventStreamConfig,
    LiveConsumer, MemoryEventStore, ResumeError, RevisionInterest, SourceError, Subscription,
    Transaction, WallClock,
};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

struct FixedClock(u64);

impl WallClock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Replay,
    Live,
}

#[derive(Default)]
struct ConsumerState {
    seen: Mutex<Vec<(String, u64, Phase)>>,
    next: Mutex<HashMap<String, u64>>,
    fail_replay_at: Option<(String, u64)>,
}

impl ConsumerState {
    fn apply(&self, txn: &Transaction<String>, phase: Phase) -> Result<(), ConsumerError> {
        if phase == Phase::Replay {
            if let Some((stream, revision)) = &self.fail_replay_at {
                if *stream == txn.stream_id && *revision == txn.revision {
                    return Err("projection write refused".into());
                }
            }
        }
        self.seen
            .lock()
            .unwrap()
            .push((txn.stream_id.clone(), txn.revision, phase));
        self.next
            .lock()
            .unwrap()
            .insert(txn.stream_id.clone(), txn.revision + 1);
        Ok(())
    }

    fn seen_for(&self, stream: &str) -> Vec<(u64, Phase)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == stream)
            .map(|(_, revision, phase)| (*revision, *phase))
            .collect()
    }

    fn total_seen(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn live_count(&self) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, phase)| *phase == Phase::Live)
            .count()
    }
}

struct RecordingConsumer {
    last_ts: Option<u64>,
    state: Arc<ConsumerState>,
}

impl DurableConsumer<String> for RecordingConsumer {
    fn last_timestamp(&self) -> Option<u64> {
        self.last_ts
    }

    fn category_filter(&self) -> CategoryFilter {
        CategoryFilter::all()
    }

    fn consume_replay(&self, txn: Transaction<String>) -> Result<(), ConsumerError> {
        self.state.apply(&txn, Phase::Replay)
    }

    fn on_live(&self) -> Arc<dyn LiveConsumer<String>> {
        Arc::new(RecordingLive {
            state: self.state.clone(),
        })
    }
}

struct RecordingLive {
    state: Arc<ConsumerState>,
}

impl LiveConsumer<String> for RecordingLive {
    fn expected_revision(&self, stream_id: &str) -> RevisionInterest {
        RevisionInterest::Track(
            *self
                .state
                .next
                .lock()
                .unwrap()
                .get(stream_id)
                .unwrap_or(&0),
        )
    }

    fn consume_live(&self, txn: Transaction<String>) -> Result<(), ConsumerError> {
        self.state.apply(&txn, Phase::Live)
    }
}

/// Source that commits `tail` transactions at subscription time, landing them
/// in the window between end-of-replay and activation.
struct RacingSource {
    store: MemoryEventStore<String>,
    tail: Mutex<Vec<Transaction<String>>>,
}

impl EventSource<String> for RacingSource {
    fn subscribe(
        &self,
        sink: Box<dyn Fn(Transaction<String>) + Send + Sync>,
        filter: CategoryFilter,
    ) -> Result<Box<dyn Subscription>, SourceError> {
        let subscription = self.store.subscribe(sink, filter)?;
        for txn in self.tail.lock().unwrap().drain(..) {
            self.store.append(txn).unwrap();
        }
        Ok(subscription)
    }

    fn replay(
        &self,
        filter: &CategoryFilter,
    ) -> Result<Box<dyn Iterator<Item = Transaction<String>> + Send>, SourceError> {
        self.store.replay(filter)
    }

    fn replay_from(
        &self,
        since_ms: u64,
        filter: &CategoryFilter,
    ) -> Result<Box<dyn Iterator<Item = Transaction<String>> + Send>, SourceError> {
        self.store.replay_from(since_ms, filter)
    }

    fn replay_stream_range(
        &self,
        stream_id: &str,
        revisions: Range<u64>,
    ) -> Result<Box<dyn Iterator<Item = Transaction<String>> + Send>, SourceError> {
        self.store.replay_stream_range(stream_id, revisions)
    }
}

fn txn(stream: &str, revision: u64, timestamp_ms: u64) -> Transaction<String> {
    Transaction::new(
        timestamp_ms,
        "orders",
        stream,
        revision,
        vec![format!("evt-{revision}")],
    )
}

fn config(name: &str) -> EventStreamConfig {
    EventStreamConfig {
        name: name.to_string(),
        worker_count: 2,
        replay_buffer: 4,
        gap_replay_delay_ms: 20,
        max_clock_skew_ms: 0,
        ..EventStreamConfig::default()
    }
}

#[test]
fn cutover_delivers_raced_transactions_exactly_once() {
    let store = MemoryEventStore::new();
    for revision in 0..10 {
        store.append(txn("s", revision, 500 + revision)).unwrap();
    }
    let source = Arc::new(RacingSource {
        store: store.clone(),
        tail: Mutex::new(vec![txn("s", 10, 510), txn("s", 11, 511)]),
    });

    let stream = EventStream::with_clock(source, config("cutover"), Arc::new(FixedClock(1_000)))
        .unwrap();
    let state = Arc::new(ConsumerState::default());
    let subscription = stream
        .resume(Arc::new(RecordingConsumer {
            last_ts: None,
            state: state.clone(),
        }))
        .unwrap();
    assert!(subscription.is_active());

    wait_for(Duration::from_secs(2), || state.total_seen() == 12);
    // Let any duplicate delivery surface before asserting exactly-once.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(state.total_seen(), 12);

    let seen = state.seen_for("s");
    let revisions: Vec<u64> = seen.iter().map(|(revision, _)| *revision).collect();
    assert_eq!(revisions, (0..12).collect::<Vec<u64>>());
    for (revision, phase) in seen {
        let expected = if revision < 10 { Phase::Replay } else { Phase::Live };
        assert_eq!(phase, expected, "revision {revision}");
    }

    // Revision 9 re-read by the bridging replay plus the doubly-delivered
    // 10 and 11 all hit the duplicate branch.
    wait_for(Duration::from_secs(2), || stream.telemetry().duplicates() == 3);
    assert_eq!(stream.telemetry().gaps_opened(), 0);
    subscription.cancel();
}

#[test]
fn resume_replays_from_persisted_timestamp_minus_skew() {
    let store = MemoryEventStore::new();
    store.append(txn("s", 0, 100)).unwrap();
    store.append(txn("s", 1, 200)).unwrap();
    store.append(txn("s", 2, 300)).unwrap();
    let source = Arc::new(RacingSource {
        store: store.clone(),
        tail: Mutex::new(Vec::new()),
    });

    let mut cfg = config("skewed");
    cfg.max_clock_skew_ms = 60;
    let stream =
        EventStream::with_clock(source, cfg, Arc::new(FixedClock(1_000))).unwrap();
    let state = Arc::new(ConsumerState::default());
    // Simulate a consumer that had processed revisions 0 and 1 already.
    state.next.lock().unwrap().insert("s".to_string(), 2);
    let subscription = stream
        .resume(Arc::new(RecordingConsumer {
            last_ts: Some(250),
            state: state.clone(),
        }))
        .unwrap();

    // replay_from(250 - 60) skips revision 0 and re-reads 1 and 2; the
    // recorder treats the re-read as idempotent application.
    let replayed: Vec<u64> = state
        .seen_for("s")
        .iter()
        .filter(|(_, phase)| *phase == Phase::Replay)
        .map(|(revision, _)| *revision)
        .collect();
    assert_eq!(replayed, vec![1, 2]);

    store.append(txn("s", 3, 1_200)).unwrap();
    wait_for(Duration::from_secs(2), || {
        state.seen_for("s").contains(&(3, Phase::Live))
    });
    subscription.cancel();
}

#[test]
fn replay_consumer_failure_fails_resume_without_going_live() {
    let store = MemoryEventStore::new();
    store.append(txn("s1", 0, 10)).unwrap();
    store.append(txn("s2", 0, 15)).unwrap();
    store.append(txn("s1", 1, 20)).unwrap();
    store.append(txn("s2", 1, 25)).unwrap();
    store.append(txn("s1", 2, 30)).unwrap();
    store.append(txn("s2", 2, 35)).unwrap();
    let source = Arc::new(RacingSource {
        store: store.clone(),
        tail: Mutex::new(Vec::new()),
    });

    let stream = EventStream::with_clock(
        source,
        config("failing"),
        Arc::new(FixedClock(1_000)),
    )
    .unwrap();
    let state = Arc::new(ConsumerState {
        fail_replay_at: Some(("s1".to_string(), 1)),
        ..ConsumerState::default()
    });
    let result = stream.resume(Arc::new(RecordingConsumer {
        last_ts: None,
        state: state.clone(),
    }));

    match result {
        Err(ResumeError::StreamsReplayFailure { failed }) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].stream_id, "s1");
            assert_eq!(failed[0].category, "orders");
            assert!(failed[0].error.contains("projection write refused"));
        }
        other => panic!("expected StreamsReplayFailure, got {other:?}"),
    }
    assert_eq!(stream.failed_streams().len(), 1);

    // No live subscription was installed: later commits reach nobody.
    let before = state.live_count();
    store.append(txn("s2", 3, 2_000)).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(state.live_count(), before);
}
