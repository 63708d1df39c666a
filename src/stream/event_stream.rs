use crate::config::{ConfigError, EventStreamConfig};
use crate::event::source::{DurableConsumer, EventSource, LiveConsumer, SourceError, Subscription};
use crate::event::transaction::Transaction;
use crate::observability::logging::{LogLevel, StreamLog};
use crate::observability::telemetry::PipelineTelemetry;
use crate::runtime::clock::{SystemWallClock, WallClock};
use crate::runtime::completion::TaskFailure;
use crate::runtime::executor::StreamExecutor;
use crate::runtime::scheduler::{ReplayScheduler, TaskHandle};
use crate::stream::fail_safe::{FailSafeHandler, FailedStream, FailedStreamTable};
use crate::stream::handler::{DeliveryError, TransactionHandler};
use crate::stream::replay::{run_replay, ReplayError, ReplaySettings};
use crate::stream::sequenced::{GapMonitor, SequencedHandler};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use thiserror::Error;

/// Errors failing a [`EventStream::resume`] call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResumeError {
    /// One or more streams failed their consumer during replay; the consumer
    /// is not allowed to go live.
    #[error("replay failed for {} stream(s)", .failed.len())]
    StreamsReplayFailure { failed: Vec<FailedStream> },
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Scheduled range replays keyed by stream, registered put-if-absent on gap
/// detection and cleared on gap closure, firing, or cancellation.
#[derive(Debug, Default)]
pub struct PendingReplayTable {
    entries: Mutex<HashMap<String, TaskHandle>>,
}

impl PendingReplayTable {
    /// Registers a handle unless the stream already has one; the rejected
    /// handle is handed back for cancellation.
    pub fn insert_if_absent(&self, stream_id: &str, handle: TaskHandle) -> Result<(), TaskHandle> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(stream_id) {
            return Err(handle);
        }
        entries.insert(stream_id.to_string(), handle);
        Ok(())
    }

    pub fn remove(&self, stream_id: &str) -> Option<TaskHandle> {
        self.entries.lock().unwrap().remove(stream_id)
    }

    pub fn cancel_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for handle in entries.values() {
            handle.cancel();
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Live subscription returned by [`EventStream::resume`]. Cancelling stops
/// the feed and withdraws scheduled gap replays; in-flight work completes.
pub struct StreamSubscription {
    inner: Box<dyn Subscription>,
    pending: Arc<PendingReplayTable>,
}

impl std::fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription").finish_non_exhaustive()
    }
}

impl StreamSubscription {
    pub fn cancel(&self) {
        self.inner.cancel();
        self.pending.cancel_all();
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }
}

/// Innermost live layer: dispatches each ordered transaction onto the
/// partitioned executor, recording consumer failures against the stream.
struct LiveDispatcher<E> {
    executor: Arc<StreamExecutor>,
    live: Arc<dyn LiveConsumer<E>>,
    failed: Arc<FailedStreamTable>,
    telemetry: Arc<PipelineTelemetry>,
    log: StreamLog,
}

impl<E: Send + 'static> TransactionHandler<E> for LiveDispatcher<E> {
    fn handle(&self, txn: Transaction<E>) -> Result<(), DeliveryError> {
        let stream_id = txn.stream_id.clone();
        let category = txn.category.clone();
        let revision = txn.revision;
        let live = self.live.clone();
        let failed = self.failed.clone();
        let telemetry = self.telemetry.clone();
        let log = self.log.clone();
        let job_stream = stream_id.clone();
        let submitted = self.executor.submit(&stream_id, move || {
            if failed.contains(&job_stream) {
                return Ok(());
            }
            match live.consume_live(txn) {
                Ok(()) => {
                    telemetry.record_delivered();
                    Ok(())
                }
                Err(err) => {
                    let message = err.to_string();
                    if failed.record(&job_stream, &category, &message) {
                        telemetry.record_failed_stream();
                    }
                    log.error(
                        "live",
                        Some(&job_stream),
                        &format!("consumer failed at revision {revision}: {message}"),
                    );
                    Err(TaskFailure::new(message))
                }
            }
        });
        match submitted {
            Ok(_) => Ok(()),
            Err(err) => Err(DeliveryError::Dispatch {
                stream_id,
                reason: err.to_string(),
            }),
        }
    }
}

/// Gap observer wired into the live chain: opens a scheduled range replay per
/// gapped stream and withdraws it on closure.
struct LiveGapMonitor<E> {
    source: Arc<dyn EventSource<E>>,
    scheduler: Arc<ReplayScheduler>,
    pending: Arc<PendingReplayTable>,
    failed: Arc<FailedStreamTable>,
    telemetry: Arc<PipelineTelemetry>,
    log: StreamLog,
    delay: Duration,
    // Weak back-references: the chain owns the monitor, not the reverse.
    entry: OnceLock<Weak<dyn TransactionHandler<E>>>,
    sequenced: OnceLock<Weak<SequencedHandler<E>>>,
    me: OnceLock<Weak<LiveGapMonitor<E>>>,
}

impl<E: Clone + Send + Sync + 'static> LiveGapMonitor<E> {
    /// Closes the construction cycle: the monitor feeds range replays back
    /// into the chain that owns it.
    fn bind(
        self: &Arc<Self>,
        entry: &Arc<dyn TransactionHandler<E>>,
        sequenced: &Arc<SequencedHandler<E>>,
    ) {
        let _ = self.entry.set(Arc::downgrade(entry));
        let _ = self.sequenced.set(Arc::downgrade(sequenced));
        let _ = self.me.set(Arc::downgrade(self));
    }

    fn schedule_range(&self, stream_id: &str, lo: u64, hi: u64) {
        let handle = TaskHandle::unscheduled();
        if self
            .pending
            .insert_if_absent(stream_id, handle.clone())
            .is_err()
        {
            // A replay for this stream is already pending; the newcomer loses.
            return;
        }
        let stream = stream_id.to_string();
        let source = self.source.clone();
        let pending = self.pending.clone();
        let failed = self.failed.clone();
        let telemetry = self.telemetry.clone();
        let log = self.log.clone();
        let entry = self.entry.get().cloned();
        let sequenced = self.sequenced.get().cloned();
        let me = self.me.get().cloned();
        self.scheduler.schedule_with(&handle, self.delay, move || {
            pending.remove(&stream);
            if failed.contains(&stream) {
                return;
            }
            let Some(entry) = entry.and_then(|weak| weak.upgrade()) else {
                return;
            };
            match source.replay_stream_range(&stream, lo..hi) {
                Ok(transactions) => {
                    let mut fed = 0u64;
                    for txn in transactions {
                        let _ = entry.handle(txn);
                        fed += 1;
                    }
                    telemetry.record_range_replay();
                    log.info(
                        "gap_replay",
                        Some(&stream),
                        &format!("replayed {fed} transaction(s) from range {lo}..{hi}"),
                    );
                }
                Err(err) => {
                    log.error(
                        "gap_replay",
                        Some(&stream),
                        &format!("range {lo}..{hi} replay failed: {err}"),
                    );
                }
            }
            // The journal may still be catching up; keep a replay pending
            // until the gap actually closes.
            let sequenced = sequenced.and_then(|weak| weak.upgrade());
            if let (Some(sequenced), Some(me)) = (sequenced, me) {
                if let Some(bounds) = sequenced.missing_range(&stream) {
                    if let Some(monitor) = me.upgrade() {
                        monitor.schedule_range(&stream, bounds.expected, bounds.actual);
                    }
                }
            }
        });
    }
}

impl<E: Clone + Send + Sync + 'static> GapMonitor for LiveGapMonitor<E> {
    fn gap_detected(&self, stream_id: &str, expected: u64, actual: u64) {
        self.telemetry.record_gap_opened();
        self.log.warn(
            "sequencer",
            Some(stream_id),
            &format!("gap opened: missing revisions {expected}..{actual}"),
        );
        self.schedule_range(stream_id, expected, actual);
    }

    fn gap_closed(&self, stream_id: &str) {
        self.telemetry.record_gap_closed();
        self.log.info("sequencer", Some(stream_id), "gap closed");
        if let Some(handle) = self.pending.remove(stream_id) {
            handle.cancel();
        }
    }

    fn duplicate(&self, stream_id: &str, revision: u64) {
        self.telemetry.record_duplicate();
        self.log.emit(
            LogLevel::Debug,
            "sequencer",
            Some(stream_id),
            &format!("dropped duplicate revision {revision}"),
        );
    }
}

/// Durable consumption front-end over an [`EventSource`]: replays a consumer
/// from the journal, then cuts it over to the live feed without loss or
/// duplication.
pub struct EventStream<E> {
    source: Arc<dyn EventSource<E>>,
    config: EventStreamConfig,
    executor: Arc<StreamExecutor>,
    scheduler: Arc<ReplayScheduler>,
    failed: Arc<FailedStreamTable>,
    pending: Arc<PendingReplayTable>,
    telemetry: Arc<PipelineTelemetry>,
    log: StreamLog,
    clock: Arc<dyn WallClock>,
}

impl<E: Clone + Send + Sync + 'static> EventStream<E> {
    pub fn new(
        source: Arc<dyn EventSource<E>>,
        config: EventStreamConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(source, config, Arc::new(SystemWallClock))
    }

    /// Injects the wall clock; used to pin cutover timing in tests.
    pub fn with_clock(
        source: Arc<dyn EventSource<E>>,
        config: EventStreamConfig,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = Arc::new(StreamExecutor::new(config.name.clone(), config.worker_count));
        let scheduler = Arc::new(ReplayScheduler::new(config.name.clone()));
        let log = StreamLog::new(config.log_capacity, clock.clone());
        Ok(Self {
            source,
            executor,
            scheduler,
            failed: Arc::new(FailedStreamTable::default()),
            pending: Arc::new(PendingReplayTable::default()),
            telemetry: Arc::new(PipelineTelemetry::default()),
            log,
            clock,
            config,
        })
    }

    pub fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    pub fn log(&self) -> &StreamLog {
        &self.log
    }

    pub fn failed_streams(&self) -> Vec<FailedStream> {
        self.failed.snapshot()
    }

    pub fn pending_replays(&self) -> usize {
        self.pending.len()
    }

    /// Replays the consumer from the journal, then bridges it onto the live
    /// feed.
    ///
    /// The live subscription is installed before the bridging replay so every
    /// transaction committed between end-of-replay and activation is seen at
    /// least once; the sequencer's duplicate branch reduces that to exactly
    /// once.
    pub fn resume(
        &self,
        consumer: Arc<dyn DurableConsumer<E>>,
    ) -> Result<StreamSubscription, ResumeError> {
        let starting_ms = self.clock.now_ms();
        let filter = consumer.category_filter();
        let skew = self.config.max_clock_skew_ms;

        let journal = match consumer.last_timestamp() {
            None => self.source.replay(&filter)?,
            Some(ts) => self.source.replay_from(ts.saturating_sub(skew), &filter)?,
        };
        self.log.info("resume", None, "replay starting");

        let settings = ReplaySettings {
            replay_buffer: self.config.replay_buffer,
            consume_timeout: self.config.consume_timeout(),
            max_replay_wait: self.config.max_replay_wait(),
        };
        let replay_consumer = consumer.clone();
        let failed = self.failed.clone();
        let telemetry = self.telemetry.clone();
        let log = self.log.clone();
        let replay_result = run_replay(
            journal,
            &self.executor,
            move |txn: Transaction<E>| {
                if failed.contains(&txn.stream_id) {
                    return Ok(());
                }
                let stream_id = txn.stream_id.clone();
                let category = txn.category.clone();
                let revision = txn.revision;
                match replay_consumer.consume_replay(txn) {
                    Ok(()) => {
                        telemetry.record_replayed();
                        Ok(())
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if failed.record(&stream_id, &category, &message) {
                            telemetry.record_failed_stream();
                        }
                        log.error(
                            "replay",
                            Some(&stream_id),
                            &format!("consumer failed at revision {revision}: {message}"),
                        );
                        Err(TaskFailure::new(message))
                    }
                }
            },
            &settings,
        );

        if !self.failed.is_empty() {
            return Err(ResumeError::StreamsReplayFailure {
                failed: self.failed.snapshot(),
            });
        }
        let last_replay_ts = replay_result?;
        self.log.info(
            "resume",
            None,
            &format!(
                "replay finished, {} transaction(s) consumed",
                self.telemetry.replayed()
            ),
        );

        let live = consumer.on_live();
        let dispatcher: Arc<dyn TransactionHandler<E>> = Arc::new(LiveDispatcher {
            executor: self.executor.clone(),
            live: live.clone(),
            failed: self.failed.clone(),
            telemetry: self.telemetry.clone(),
            log: self.log.clone(),
        });
        let monitor = Arc::new(LiveGapMonitor {
            source: self.source.clone(),
            scheduler: self.scheduler.clone(),
            pending: self.pending.clone(),
            failed: self.failed.clone(),
            telemetry: self.telemetry.clone(),
            log: self.log.clone(),
            delay: self.config.gap_replay_delay(),
            entry: OnceLock::new(),
            sequenced: OnceLock::new(),
            me: OnceLock::new(),
        });
        let interest_live = live.clone();
        let sequenced = Arc::new(SequencedHandler::new(
            dispatcher,
            move |stream_id: &str| interest_live.expected_revision(stream_id),
            monitor.clone(),
            self.config.sequence_buffer_limit,
        ));
        let entry: Arc<FailSafeHandler<E>> = Arc::new(FailSafeHandler::new(
            sequenced.clone(),
            self.failed.clone(),
            self.telemetry.clone(),
            self.log.clone(),
        ));
        let chain_entry: Arc<dyn TransactionHandler<E>> = entry.clone();
        monitor.bind(&chain_entry, &sequenced);

        // Subscribe before the bridging replay; the overlap is deduplicated.
        let sink_entry = entry.clone();
        let subscription = self.source.subscribe(
            Box::new(move |txn| {
                let _ = sink_entry.handle(txn);
            }),
            filter.clone(),
        )?;

        let bridge_from = last_replay_ts.unwrap_or(starting_ms).saturating_sub(skew);
        let mut bridged = 0u64;
        for txn in self.source.replay_from(bridge_from, &filter)? {
            let _ = entry.handle(txn);
            bridged += 1;
        }
        self.log.info(
            "resume",
            None,
            &format!("cutover complete, bridged {bridged} transaction(s)"),
        );

        Ok(StreamSubscription {
            inner: subscription,
            pending: self.pending.clone(),
        })
    }
}
