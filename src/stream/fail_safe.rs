use crate::event::transaction::Transaction;
use crate::observability::logging::StreamLog;
use crate::observability::telemetry::PipelineTelemetry;
use crate::stream::handler::{DeliveryError, TransactionHandler};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Record of a stream whose consumer failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStream {
    pub stream_id: String,
    pub category: String,
    pub error: String,
}

/// Process-wide table of failed streams. Entries are inserted on the first
/// consumer failure and never auto-evicted; the table lives as long as the
/// owning `EventStream`.
#[derive(Debug, Default)]
pub struct FailedStreamTable {
    entries: Mutex<HashMap<String, FailedStream>>,
}

impl FailedStreamTable {
    pub fn contains(&self, stream_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(stream_id)
    }

    /// Records a failure, keeping the first error for a stream. Returns true
    /// when the stream was newly marked.
    pub fn record(&self, stream_id: &str, category: &str, error: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(stream_id) {
            return false;
        }
        entries.insert(
            stream_id.to_string(),
            FailedStream {
                stream_id: stream_id.to_string(),
                category: category.to_string(),
                error: error.to_string(),
            },
        );
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Snapshot sorted by stream id.
    pub fn snapshot(&self) -> Vec<FailedStream> {
        let mut streams: Vec<FailedStream> =
            self.entries.lock().unwrap().values().cloned().collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }
}

/// Outermost layer of the live chain: drops transactions for failed streams
/// and converts synchronous downstream errors into failed-stream records.
pub struct FailSafeHandler<E> {
    next: Arc<dyn TransactionHandler<E>>,
    failed: Arc<FailedStreamTable>,
    telemetry: Arc<PipelineTelemetry>,
    log: StreamLog,
}

impl<E> FailSafeHandler<E> {
    pub fn new(
        next: Arc<dyn TransactionHandler<E>>,
        failed: Arc<FailedStreamTable>,
        telemetry: Arc<PipelineTelemetry>,
        log: StreamLog,
    ) -> Self {
        Self {
            next,
            failed,
            telemetry,
            log,
        }
    }
}

impl<E> TransactionHandler<E> for FailSafeHandler<E> {
    fn handle(&self, txn: Transaction<E>) -> Result<(), DeliveryError> {
        if self.failed.contains(&txn.stream_id) {
            return Ok(());
        }
        let stream_id = txn.stream_id.clone();
        let category = txn.category.clone();
        if let Err(err) = self.next.handle(txn) {
            let message = err.to_string();
            if self.failed.record(&stream_id, &category, &message) {
                self.telemetry.record_failed_stream();
            }
            self.log
                .error("fail_safe", Some(&stream_id), &format!("stream marked failed: {message}"));
        }
        Ok(())
    }
}
