use sequentra::{
    DeliveryError, FailSafeHandler, FailedStreamTable, PipelineTelemetry, StreamLog,
    SystemWallClock, Transaction, TransactionHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn txn(stream: &str, revision: u64) -> Transaction<u32> {
    Transaction::new(1_000, "billing", stream, revision, vec![0])
}

#[test]
fn failed_stream_table_keeps_first_error_and_sorts_snapshots() {
    let table = FailedStreamTable::default();
    assert!(table.is_empty());

    assert!(table.record("s2", "billing", "boom"));
    assert!(!table.record("s2", "billing", "later"));
    assert!(table.record("s1", "billing", "other"));

    assert_eq!(table.len(), 2);
    assert!(table.contains("s1"));
    let snapshot = table.snapshot();
    assert_eq!(snapshot[0].stream_id, "s1");
    assert_eq!(snapshot[1].stream_id, "s2");
    assert_eq!(snapshot[1].error, "boom");
}

#[test]
fn downstream_errors_mark_the_stream_failed() {
    let failed = Arc::new(FailedStreamTable::default());
    let telemetry = Arc::new(PipelineTelemetry::default());
    let log = StreamLog::new(64, Arc::new(SystemWallClock));
    let calls = Arc::new(AtomicUsize::new(0));

    let next_calls = calls.clone();
    let next: Arc<dyn TransactionHandler<u32>> = Arc::new(move |txn: Transaction<u32>| {
        next_calls.fetch_add(1, Ordering::SeqCst);
        if txn.stream_id == "bad" {
            return Err(DeliveryError::Dispatch {
                stream_id: txn.stream_id.clone(),
                reason: "queue unavailable".to_string(),
            });
        }
        Ok(())
    });
    let handler = FailSafeHandler::new(next, failed.clone(), telemetry.clone(), log.clone());

    handler.handle(txn("good", 0)).unwrap();
    handler.handle(txn("bad", 0)).unwrap();
    assert!(failed.contains("bad"));
    assert_eq!(telemetry.failed_streams(), 1);

    // Subsequent transactions for the failed stream are dropped before the
    // downstream layer sees them.
    handler.handle(txn("bad", 1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Healthy streams keep flowing.
    handler.handle(txn("good", 1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snapshot = failed.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].category, "billing");
    assert!(snapshot[0].error.contains("queue unavailable"));
}

#[test]
fn delivered_transactions_pass_through_untouched() {
    let failed = Arc::new(FailedStreamTable::default());
    let telemetry = Arc::new(PipelineTelemetry::default());
    let log = StreamLog::new(64, Arc::new(SystemWallClock));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let next_seen = seen.clone();
    let next: Arc<dyn TransactionHandler<u32>> = Arc::new(move |txn: Transaction<u32>| {
        next_seen.lock().unwrap().push((txn.stream_id.clone(), txn.revision));
        Ok(())
    });
    let handler = FailSafeHandler::new(next, failed.clone(), telemetry, log);

    handler.handle(txn("a", 0)).unwrap();
    handler.handle(txn("b", 3)).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("a".to_string(), 0), ("b".to_string(), 3)]
    );
    assert!(failed.is_empty());
}
