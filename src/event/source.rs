use crate::event::transaction::{CategoryFilter, RevisionInterest, Transaction};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

/// Failure type surfaced by durable and live consumers.
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by an event source while serving replays or subscriptions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("event source is closed")]
    Closed,
    #[error("replay range {lo}..{hi} for stream {stream_id} is invalid")]
    InvalidRange { stream_id: String, lo: u64, hi: u64 },
}

/// Handle to an active live subscription.
pub trait Subscription: Send + Sync {
    /// Terminates the live feed. In-flight transactions complete.
    fn cancel(&self);

    fn is_active(&self) -> bool;
}

/// Minimal contract the ordered delivery pipeline requires from the journal
/// and its pub/sub side.
pub trait EventSource<E>: Send + Sync {
    /// Registers `sink` for asynchronous delivery of newly committed
    /// transactions matching `filter`.
    fn subscribe(
        &self,
        sink: Box<dyn Fn(Transaction<E>) + Send + Sync>,
        filter: CategoryFilter,
    ) -> Result<Box<dyn Subscription>, SourceError>;

    /// Finite iterator over the journal in `(timestamp, stream_id, revision)`
    /// order, restricted to `filter`.
    fn replay(
        &self,
        filter: &CategoryFilter,
    ) -> Result<Box<dyn Iterator<Item = Transaction<E>> + Send>, SourceError>;

    /// Like [`EventSource::replay`] but limited to entries with
    /// `timestamp_ms >= since_ms`.
    fn replay_from(
        &self,
        since_ms: u64,
        filter: &CategoryFilter,
    ) -> Result<Box<dyn Iterator<Item = Transaction<E>> + Send>, SourceError>;

    /// Iterator over the half-open revision range of a single stream, in
    /// revision order.
    fn replay_stream_range(
        &self,
        stream_id: &str,
        revisions: Range<u64>,
    ) -> Result<Box<dyn Iterator<Item = Transaction<E>> + Send>, SourceError>;
}

/// A durable consumer catching up from the journal before going live.
pub trait DurableConsumer<E>: Send + Sync {
    /// Timestamp of the last transaction this consumer has durably processed,
    /// persisted externally. `None` requests a full replay.
    fn last_timestamp(&self) -> Option<u64>;

    /// Categories the consumer subscribes to. An empty filter means all.
    fn category_filter(&self) -> CategoryFilter;

    /// Invoked serially per stream for every historical transaction.
    fn consume_replay(&self, txn: Transaction<E>) -> Result<(), ConsumerError>;

    /// Called once replay finishes, returning the live-phase interface.
    fn on_live(&self) -> Arc<dyn LiveConsumer<E>>;
}

/// Live-phase interface of a durable consumer.
pub trait LiveConsumer<E>: Send + Sync {
    /// Seeds the per-stream sequencer when a stream is first seen live.
    fn expected_revision(&self, stream_id: &str) -> RevisionInterest;

    /// Receives live transactions in strict per-stream revision order.
    fn consume_live(&self, txn: Transaction<E>) -> Result<(), ConsumerError>;
}
