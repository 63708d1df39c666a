use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Failure payload carried by a completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of awaiting a completion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitOutcome {
    Completed,
    Failed(TaskFailure),
    TimedOut,
}

#[derive(Debug)]
enum CompletionState {
    Pending,
    Done(Option<TaskFailure>),
}

#[derive(Debug)]
struct CompletionShared {
    state: Mutex<CompletionState>,
    cv: Condvar,
}

/// One-shot handle fulfilled by the executor worker that ran the submitted
/// job. Cloneable; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    shared: Arc<CompletionShared>,
}

impl CompletionHandle {
    pub(crate) fn pending() -> Self {
        Self {
            shared: Arc::new(CompletionShared {
                state: Mutex::new(CompletionState::Pending),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn complete(&self, result: Result<(), TaskFailure>) {
        let mut state = self.shared.state.lock().unwrap();
        if matches!(*state, CompletionState::Done(_)) {
            return;
        }
        *state = CompletionState::Done(result.err());
        self.shared.cv.notify_all();
    }

    /// Blocks until the task finishes or `timeout` elapses.
    pub fn await_done(&self, timeout: Duration) -> AwaitOutcome {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match &*state {
                CompletionState::Done(None) => return AwaitOutcome::Completed,
                CompletionState::Done(Some(failure)) => {
                    return AwaitOutcome::Failed(failure.clone());
                }
                CompletionState::Pending => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return AwaitOutcome::TimedOut;
                    }
                    let (next, _) = self
                        .shared
                        .cv
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    /// Non-blocking completion probe.
    pub fn is_done(&self) -> bool {
        matches!(
            *self.shared.state.lock().unwrap(),
            CompletionState::Done(_)
        )
    }
}
