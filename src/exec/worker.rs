//! Cooperative worker: a FIFO operation queue drained serially by one task

use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Buffer for unhandled-error subscribers.
const ERROR_BUFFER: usize = 16;

/// The future produced by a queued operation.
pub type OperationFuture = futures::future::BoxFuture<'static, Result<()>>;

/// A queued unit of work: called once when its turn arrives.
pub type Operation = Box<dyn FnOnce() -> OperationFuture + Send + 'static>;

/// Queue priority. `High` enqueues jump ahead of `Normal` ones; ordering
/// among equal priorities stays first-in-first-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationPriority {
    /// Background work (scheduled runs)
    Normal = 1,
    /// Preempting work (manually triggered dial-up runs)
    High = 2,
}

struct QueuedOperation {
    priority: OperationPriority,
    op: Operation,
}

struct WorkerInner {
    queue: Mutex<VecDeque<QueuedOperation>>,
    wake: Notify,
    error_tx: broadcast::Sender<Arc<Error>>,
    cancel: CancellationToken,
}

/// A FIFO of operations drained by a dedicated task.
///
/// At most one operation runs at a time on a given worker; everything else
/// waits its turn. An operation that fails (or panics) raises an event on the
/// unhandled-error channel and the worker continues with the next operation.
#[derive(Clone)]
pub struct CooperativeWorker {
    inner: Arc<WorkerInner>,
}

impl CooperativeWorker {
    /// Spawn a worker with the given queue-depth hint.
    pub fn spawn(queue_hint: usize) -> Self {
        let (error_tx, _rx) = broadcast::channel(ERROR_BUFFER);
        let inner = Arc::new(WorkerInner {
            queue: Mutex::new(VecDeque::with_capacity(queue_hint)),
            wake: Notify::new(),
            error_tx,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Self::drain(inner.clone()));
        Self { inner }
    }

    /// Enqueue an operation.
    ///
    /// A `High` operation is inserted ahead of every queued `Normal` one but
    /// behind earlier `High` ones, keeping equal ranks first-in-first-out.
    pub fn enqueue(&self, priority: OperationPriority, op: Operation) {
        {
            let mut queue = lock_queue(&self.inner.queue);
            let index = queue
                .iter()
                .position(|queued| queued.priority < priority)
                .unwrap_or(queue.len());
            queue.insert(index, QueuedOperation { priority, op });
        }
        self.inner.wake.notify_one();
    }

    /// Subscribe to errors escaping queued operations.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<Error>> {
        self.inner.error_tx.subscribe()
    }

    /// Number of operations waiting (not counting one in flight).
    pub fn queued_len(&self) -> usize {
        lock_queue(&self.inner.queue).len()
    }

    /// Stop the worker after the operation in flight, discarding the queue.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.wake.notify_one();
    }

    async fn drain(inner: Arc<WorkerInner>) {
        loop {
            if inner.cancel.is_cancelled() {
                break;
            }

            let next = lock_queue(&inner.queue).pop_front();
            match next {
                Some(queued) => {
                    let future = (queued.op)();
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "queued operation failed");
                            inner.error_tx.send(Arc::new(e)).ok();
                        }
                        Err(_) => {
                            tracing::error!("queued operation panicked");
                            inner
                                .error_tx
                                .send(Arc::new(Error::Other(
                                    "queued operation panicked".to_string(),
                                )))
                                .ok();
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = inner.wake.notified() => {}
                    }
                }
            }
        }
    }
}

fn lock_queue(queue: &Mutex<VecDeque<QueuedOperation>>) -> MutexGuard<'_, VecDeque<QueuedOperation>> {
    match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn recording_op(tx: mpsc::UnboundedSender<u32>, tag: u32) -> Operation {
        Box::new(move || {
            Box::pin(async move {
                tx.send(tag).ok();
                Ok(())
            })
        })
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<u32>, n: usize) -> Vec<u32> {
        let mut seen = Vec::with_capacity(n);
        for _ in 0..n {
            let tag = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("operation should run")
                .unwrap();
            seen.push(tag);
        }
        seen
    }

    #[tokio::test]
    async fn operations_run_in_fifo_order() {
        let worker = CooperativeWorker::spawn(4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for tag in 0..5 {
            worker.enqueue(OperationPriority::Normal, recording_op(tx.clone(), tag));
        }

        assert_eq!(collect(&mut rx, 5).await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn high_priority_jumps_ahead_of_normal_only() {
        let worker = CooperativeWorker::spawn(4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Stall the worker so the queue builds up deterministically.
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        worker.enqueue(
            OperationPriority::Normal,
            Box::new(move || {
                Box::pin(async move {
                    release.notified().await;
                    Ok(())
                })
            }),
        );

        worker.enqueue(OperationPriority::Normal, recording_op(tx.clone(), 1));
        worker.enqueue(OperationPriority::High, recording_op(tx.clone(), 100));
        worker.enqueue(OperationPriority::High, recording_op(tx.clone(), 101));
        worker.enqueue(OperationPriority::Normal, recording_op(tx.clone(), 2));
        gate.notify_one();

        // Highs run first, in their own FIFO order, then normals in theirs.
        assert_eq!(collect(&mut rx, 4).await, vec![100, 101, 1, 2]);
    }

    #[tokio::test]
    async fn at_most_one_operation_in_flight() {
        let worker = CooperativeWorker::spawn(4);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for tag in 0..8 {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            let tx = tx.clone();
            worker.enqueue(
                OperationPriority::Normal,
                Box::new(move || {
                    Box::pin(async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        tx.send(tag).ok();
                        Ok(())
                    })
                }),
            );
        }

        collect(&mut rx, 8).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_operation_raises_event_and_worker_continues() {
        let worker = CooperativeWorker::spawn(4);
        let mut errors = worker.subscribe_errors();
        let (tx, mut rx) = mpsc::unbounded_channel();

        worker.enqueue(
            OperationPriority::Normal,
            Box::new(|| Box::pin(async { Err(Error::Other("boom".to_string())) })),
        );
        worker.enqueue(OperationPriority::Normal, recording_op(tx, 7));

        let err = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.to_string().contains("boom"));
        assert_eq!(collect(&mut rx, 1).await, vec![7]);
    }

    #[tokio::test]
    async fn panicking_operation_raises_event_and_worker_continues() {
        let worker = CooperativeWorker::spawn(4);
        let mut errors = worker.subscribe_errors();
        let (tx, mut rx) = mpsc::unbounded_channel();

        worker.enqueue(
            OperationPriority::Normal,
            Box::new(|| Box::pin(async { panic!("unexpected") })),
        );
        worker.enqueue(OperationPriority::Normal, recording_op(tx, 9));

        let err = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(collect(&mut rx, 1).await, vec![9]);
    }

    #[tokio::test]
    async fn shutdown_stops_draining() {
        let worker = CooperativeWorker::spawn(4);
        worker.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.enqueue(OperationPriority::Normal, recording_op(tx, 1));
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "operations must not run after shutdown");
    }
}
