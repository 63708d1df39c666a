use crate::event::transaction::{RevisionInterest, Transaction};
use crate::stream::handler::{DeliveryError, TransactionHandler};
use crate::stream::sequencer::{GapBounds, RevisionSequencer, SequenceError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Observer of per-stream ordering events. Callbacks run inside the handler's
/// critical section, so implementations must not re-enter the handler.
pub trait GapMonitor: Send + Sync {
    fn gap_detected(&self, stream_id: &str, expected: u64, actual: u64);
    fn gap_closed(&self, stream_id: &str);
    fn duplicate(&self, stream_id: &str, revision: u64);
}

/// Monitor that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGapMonitor;

impl GapMonitor for NullGapMonitor {
    fn gap_detected(&self, _stream_id: &str, _expected: u64, _actual: u64) {}
    fn gap_closed(&self, _stream_id: &str) {}
    fn duplicate(&self, _stream_id: &str, _revision: u64) {}
}

/// Per-stream delivery state.
///
/// `InSequence` carries only the delivery cursor; the buffering state owns a
/// full sequencer, created when the first gap opens and torn down when it
/// closes. `Ignored` streams accept anything.
enum StreamTrack<E> {
    InSequence { expected: u64 },
    Buffering(RevisionSequencer<Transaction<E>>),
    Ignored,
}

/// Routes each transaction through its stream's ordering state, delivering to
/// the next layer strictly in revision order and reporting gap transitions.
///
/// All per-stream decisions run under one mutex, which both replaces the
/// lock-free concurrent sequencer map and serializes the live dispatcher
/// against scheduled gap-replay feeds. Downstream consumption stays parallel:
/// the next layer only enqueues work onto the partitioned executor.
pub struct SequencedHandler<E> {
    next: Arc<dyn TransactionHandler<E>>,
    interest: Box<dyn Fn(&str) -> RevisionInterest + Send + Sync>,
    monitor: Arc<dyn GapMonitor>,
    buffer_limit: usize,
    streams: Mutex<HashMap<String, StreamTrack<E>>>,
}

impl<E> SequencedHandler<E> {
    pub fn new(
        next: Arc<dyn TransactionHandler<E>>,
        interest: impl Fn(&str) -> RevisionInterest + Send + Sync + 'static,
        monitor: Arc<dyn GapMonitor>,
        buffer_limit: usize,
    ) -> Self {
        Self {
            next,
            interest: Box::new(interest),
            monitor,
            buffer_limit,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// The missing interval of a stream while it is buffering.
    pub fn missing_range(&self, stream_id: &str) -> Option<GapBounds> {
        let streams = self.streams.lock().unwrap();
        match streams.get(stream_id) {
            Some(StreamTrack::Buffering(sequencer)) => sequencer.missing_range(),
            _ => None,
        }
    }

    /// Whether the stream currently has an open gap epoch.
    pub fn is_gapped(&self, stream_id: &str) -> bool {
        self.missing_range(stream_id).is_some()
    }

    fn deliver(&self, txn: Transaction<E>) -> Result<(), DeliveryError> {
        self.next.handle(txn)
    }
}

impl<E: Send> TransactionHandler<E> for SequencedHandler<E> {
    fn handle(&self, txn: Transaction<E>) -> Result<(), DeliveryError> {
        let stream_id = txn.stream_id.clone();
        let revision = txn.revision;
        let mut streams = self.streams.lock().unwrap();

        let track = streams.entry(stream_id.clone()).or_insert_with(|| {
            match (self.interest)(&stream_id) {
                RevisionInterest::IgnoreHistory => StreamTrack::Ignored,
                RevisionInterest::Track(expected) => StreamTrack::InSequence { expected },
            }
        });

        match track {
            StreamTrack::Ignored => self.deliver(txn),
            StreamTrack::InSequence { expected } => {
                if revision == *expected {
                    *expected += 1;
                    self.deliver(txn)
                } else if revision < *expected {
                    self.monitor.duplicate(&stream_id, revision);
                    Ok(())
                } else {
                    let initial = *expected;
                    let mut sequencer = RevisionSequencer::new(initial, self.buffer_limit);
                    let outcome = sequencer
                        .offer(revision, txn)
                        .expect("fresh sequencer cannot overflow");
                    *track = StreamTrack::Buffering(sequencer);
                    if let Some(GapBounds { expected, actual }) = outcome.gap_opened {
                        self.monitor.gap_detected(&stream_id, expected, actual);
                    }
                    Ok(())
                }
            }
            StreamTrack::Buffering(sequencer) => {
                let outcome = match sequencer.offer(revision, txn) {
                    Ok(outcome) => outcome,
                    Err(SequenceError::BufferOverflow { limit, .. }) => {
                        return Err(DeliveryError::BufferOverflow {
                            stream_id,
                            limit,
                        });
                    }
                };
                if let Some((revision, _)) = outcome.duplicate {
                    self.monitor.duplicate(&stream_id, revision);
                }
                if let Some(GapBounds { expected, actual }) = outcome.gap_opened {
                    self.monitor.gap_detected(&stream_id, expected, actual);
                }
                let advanced = sequencer.expected();
                let closed = outcome.gap_closed;
                for (_, delivery) in outcome.deliveries {
                    self.deliver(delivery)?;
                }
                if closed {
                    // Dispatch the closure before the sequencer entry is
                    // replaced so a transaction arriving right after cannot
                    // observe stale buffering state.
                    self.monitor.gap_closed(&stream_id);
                    *track = StreamTrack::InSequence { expected: advanced };
                }
                Ok(())
            }
        }
    }
}
