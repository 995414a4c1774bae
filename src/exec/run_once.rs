//! Coalescing "run once" wrapper
//!
//! Wraps an operation on a cooperative worker so that any volume of trigger
//! calls collapses into at most one queued or executing run plus at most one
//! pending re-run. The contract:
//!
//! - for any number of concurrent triggers, executions <= triggers;
//! - at least one execution begins after the most recent trigger's enqueue
//!   point (a trigger arriving mid-run sets the pending bit, so the caller
//!   never observes a stale run as "theirs").

use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::worker::{CooperativeWorker, OperationFuture, OperationPriority};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    RunningWithPendingRerun,
}

struct RunOnceShared {
    state: Mutex<RunState>,
    /// Count of completed executions; awaited by the blocking variant.
    completions: watch::Sender<u64>,
    priority: Mutex<OperationPriority>,
}

/// Coalesces repeated trigger requests into at most one pending run.
#[derive(Clone)]
pub struct RunOnceOperation {
    worker: CooperativeWorker,
    factory: Arc<dyn Fn() -> OperationFuture + Send + Sync>,
    shared: Arc<RunOnceShared>,
}

impl RunOnceOperation {
    /// Wrap `factory` on `worker`. Each execution calls the factory once.
    pub fn new(
        worker: CooperativeWorker,
        factory: Arc<dyn Fn() -> OperationFuture + Send + Sync>,
    ) -> Self {
        let (completions, _rx) = watch::channel(0);
        Self {
            worker,
            factory,
            shared: Arc::new(RunOnceShared {
                state: Mutex::new(RunState::Idle),
                completions,
                priority: Mutex::new(OperationPriority::Normal),
            }),
        }
    }

    /// Set the priority used by subsequent enqueues.
    pub fn set_priority(&self, priority: OperationPriority) {
        *lock(&self.shared.priority) = priority;
    }

    /// Trigger a run without waiting for it.
    ///
    /// If no run is queued or executing, one is enqueued; otherwise exactly
    /// one more run is marked pending to start after the current one ends.
    pub fn run_once_async(&self) {
        let should_enqueue = {
            let mut state = lock(&self.shared.state);
            match *state {
                RunState::Idle => {
                    *state = RunState::Running;
                    true
                }
                RunState::Running => {
                    *state = RunState::RunningWithPendingRerun;
                    false
                }
                RunState::RunningWithPendingRerun => false,
            }
        };
        if should_enqueue {
            self.enqueue_execution();
        }
    }

    /// Trigger a run and wait until a run covering this trigger has finished.
    pub async fn run_once(&self) {
        let mut completions = self.shared.completions.subscribe();
        let (should_enqueue, target) = {
            let mut state = lock(&self.shared.state);
            let completed = *completions.borrow();
            match *state {
                RunState::Idle => {
                    *state = RunState::Running;
                    (true, completed + 1)
                }
                RunState::Running => {
                    *state = RunState::RunningWithPendingRerun;
                    (false, completed + 2)
                }
                // A rerun is already pending; it starts after this call.
                RunState::RunningWithPendingRerun => (false, completed + 2),
            }
        };
        if should_enqueue {
            self.enqueue_execution();
        }

        while *completions.borrow_and_update() < target {
            if completions.changed().await.is_err() {
                break;
            }
        }
    }

    /// Executions completed so far.
    pub fn completed_runs(&self) -> u64 {
        *self.shared.completions.borrow()
    }

    fn enqueue_execution(&self) {
        let this = self.clone();
        let priority = *lock(&self.shared.priority);
        self.worker.enqueue(
            priority,
            Box::new(move || {
                Box::pin(async move {
                    let result = (this.factory)().await;
                    let rerun = {
                        let mut state = lock(&this.shared.state);
                        let rerun = *state == RunState::RunningWithPendingRerun;
                        *state = if rerun {
                            RunState::Running
                        } else {
                            RunState::Idle
                        };
                        // Incremented under the state lock so waiters observe a
                        // consistent (state, count) pair.
                        this.shared.completions.send_modify(|count| *count += 1);
                        rerun
                    };
                    if rerun {
                        this.enqueue_execution();
                    }
                    result
                })
            }),
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
