use crate::event::transaction::Transaction;
use thiserror::Error;

/// Error surfaced synchronously by a handler layer. Asynchronous consumer
/// failures travel through completion handles instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("revision buffer for stream {stream_id} exceeded limit {limit}")]
    BufferOverflow { stream_id: String, limit: usize },
    #[error("executor rejected work for stream {stream_id}: {reason}")]
    Dispatch { stream_id: String, reason: String },
}

/// One layer of the delivery chain. Layers hold a reference to the next
/// layer's `handle` and are composed outermost-first.
pub trait TransactionHandler<E>: Send + Sync {
    fn handle(&self, txn: Transaction<E>) -> Result<(), DeliveryError>;
}

impl<E, F> TransactionHandler<E> for F
where
    F: Fn(Transaction<E>) -> Result<(), DeliveryError> + Send + Sync,
{
    fn handle(&self, txn: Transaction<E>) -> Result<(), DeliveryError> {
        self(txn)
    }
}
