//! Bounded pool of cooperative workers

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::worker::CooperativeWorker;

/// Queue-depth hint for pooled workers.
const POOLED_QUEUE_HINT: usize = 8;

/// Hands out cooperative workers, lazily allocating up to a cap and then
/// round-robining across the allocated set.
///
/// A cap of zero disables pooling: every request gets its own dedicated
/// worker, which the caller then owns for its lifetime.
pub struct WorkerPool {
    max_workers: usize,
    workers: Mutex<Vec<CooperativeWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with the given worker cap.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            workers: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Get a worker: a fresh one while under the cap, otherwise round-robin.
    pub fn create_worker(&self) -> CooperativeWorker {
        if self.max_workers == 0 {
            return CooperativeWorker::spawn(POOLED_QUEUE_HINT);
        }

        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if workers.len() < self.max_workers {
            let worker = CooperativeWorker::spawn(POOLED_QUEUE_HINT);
            workers.push(worker.clone());
            worker
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
            workers[index].clone()
        }
    }

    /// Number of workers allocated so far.
    pub fn allocated(&self) -> usize {
        match self.workers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Stop every pooled worker.
    pub fn shutdown(&self) {
        let workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for worker in workers.iter() {
            worker.shutdown();
        }
    }
}
