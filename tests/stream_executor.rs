use sequentra::{hash_partition_key, AwaitOutcome, StreamExecutor, SubmitError, TaskFailure};
use std::sync::atomic::{AtomicI64, Ordering};
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

#[test]
fn partition_routing_is_deterministic() {
    let executor = StreamExecutor::new("route", 4);
    assert_eq!(executor.partition_for("s1"), executor.partition_for("s1"));
    assert_eq!(
        executor.partition_for("s1"),
        (hash_partition_key("s1") % 4) as usize
    );
    executor.shutdown();
}

#[test]
fn same_key_work_runs_strictly_in_submission_order() {
    let executor = StreamExecutor::new("serial", 4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for step in 0..20u64 {
        let order = order.clone();
        let handle = executor
            .submit("stream-a", move || {
                // Give later submissions a chance to overtake if ordering
                // were broken.
                thread::sleep(Duration::from_millis(2));
                order.lock().unwrap().push(step);
                Ok(())
            })
            .unwrap();
        handles.push(handle);
    }
    for handle in handles {
        assert_eq!(handle.await_done(Duration::from_secs(5)), AwaitOutcome::Completed);
    }

    let order = order.lock().unwrap();
    assert_eq!(*order, (0..20).collect::<Vec<u64>>());
    executor.shutdown();
}

#[test]
fn distinct_partitions_run_concurrently() {
    let executor = StreamExecutor::new("parallel", 4);

    // Find two keys living on different partitions.
    let key_a = "alpha".to_string();
    let mut key_b = None;
    for candidate in 0..64 {
        let key = format!("key-{candidate}");
        if executor.partition_for(&key) != executor.partition_for(&key_a) {
            key_b = Some(key);
            break;
        }
    }
    let key_b = key_b.expect("no key hashed to a different partition");

    let concurrent = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    let mut handles = Vec::new();
    for key in [key_a.clone(), key_b] {
        let concurrent = concurrent.clone();
        let peak = peak.clone();
        let handle = executor
            .submit(&key, move || {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        handles.push(handle);
    }
    for handle in handles {
        assert_eq!(handle.await_done(Duration::from_secs(5)), AwaitOutcome::Completed);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    executor.shutdown();
}

#[test]
fn completion_handles_carry_failures_and_metrics_count_them() {
    let executor = StreamExecutor::new("failing", 2);

    let ok = executor.submit("s", || Ok(())).unwrap();
    assert_eq!(ok.await_done(Duration::from_secs(1)), AwaitOutcome::Completed);

    let failing = executor
        .submit("s", || Err(TaskFailure::new("consumer exploded")))
        .unwrap();
    assert_eq!(
        failing.await_done(Duration::from_secs(1)),
        AwaitOutcome::Failed(TaskFailure::new("consumer exploded"))
    );

    wait_for(Duration::from_secs(1), || executor.processed_total() == 2);
    let partition = executor.partition_for("s");
    assert_eq!(executor.metrics(partition).failures(), 1);
    executor.shutdown();
}

#[test]
fn await_done_times_out_while_a_job_is_still_running() {
    let executor = StreamExecutor::new("slow", 1);
    let handle = executor
        .submit("s", || {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .unwrap();
    assert_eq!(
        handle.await_done(Duration::from_millis(20)),
        AwaitOutcome::TimedOut
    );
    assert_eq!(
        handle.await_done(Duration::from_secs(2)),
        AwaitOutcome::Completed
    );
    executor.shutdown();
}

#[test]
fn shutdown_finishes_queued_work_and_rejects_new_submissions() {
    let executor = StreamExecutor::new("draining", 1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for step in 0..5u64 {
        let order = order.clone();
        handles.push(
            executor
                .submit("s", move || {
                    thread::sleep(Duration::from_millis(10));
                    order.lock().unwrap().push(step);
                    Ok(())
                })
                .unwrap(),
        );
    }

    executor.shutdown();
    assert_eq!(*order.lock().unwrap(), (0..5).collect::<Vec<u64>>());

    let rejected = executor.submit("s", || Ok(()));
    assert!(matches!(rejected, Err(SubmitError::Closed { .. })));
}
