//! Sequentra: ordered delivery for event-sourced streams.
//!
//! A durable consumer replays historical transactions from a journal, then
//! cuts over to the live pub/sub feed without loss or duplication. Per-stream
//! revision order is enforced end to end; missing revision ranges observed on
//! the unreliable live feed are recovered through scheduled journal replays.

pub mod event {
    pub mod memory;
    pub mod source;
    pub mod transaction;

    pub use memory::*;
    pub use source::*;
    pub use transaction::*;
}

pub mod observability {
    pub mod logging;
    pub mod telemetry;

    pub use logging::*;
    pub use telemetry::*;
}

pub mod runtime {
    pub mod clock;
    pub mod completion;
    pub mod executor;
    pub mod scheduler;

    pub use clock::*;
    pub use completion::*;
    pub use executor::*;
    pub use scheduler::*;
}

pub mod stream {
    pub mod event_stream;
    pub mod fail_safe;
    pub mod handler;
    pub mod replay;
    pub mod sequenced;
    pub mod sequencer;

    pub use event_stream::*;
    pub use fail_safe::*;
    pub use handler::*;
    pub use replay::*;
    pub use sequenced::*;
    pub use sequencer::*;
}

pub mod config;

pub use config::{load_config, ConfigError, EventStreamConfig};
pub use event::{
    CategoryFilter, ConsumerError, DurableConsumer, EventSource, LiveConsumer, MemoryEventStore,
    RevisionInterest, SourceError, StoreError, Subscription, Transaction,
};
pub use observability::{JsonLogBuffer, LogLevel, LoggingError, PipelineTelemetry, StreamLog};
pub use runtime::{
    hash_partition_key, AwaitOutcome, CompletionHandle, ReplayScheduler, StreamExecutor,
    SubmitError, SystemWallClock, TaskFailure, TaskHandle, WallClock,
};
pub use stream::{
    run_replay, DeliveryError, EventStream, FailSafeHandler, FailedStream, FailedStreamTable,
    GapBounds, GapMonitor, NullGapMonitor, OfferOutcome, PendingReplayTable, ReplayError,
    ReplaySettings, ResumeError, RevisionSequencer, SequenceError, SequencedHandler,
    StreamSubscription, TransactionHandler,
};
