//! Resource-serialized worker registry
//!
//! Some devices share a physical resource that admits one user at a time - in
//! practice a modem named by its phone-book entry. Pinning every device that
//! binds to the same resource key onto one cooperative worker makes their
//! runs strictly serial without any further locking.

use std::collections::HashMap;
use std::sync::Mutex;

use super::worker::CooperativeWorker;

/// Resource workers sit mostly idle; a couple of queued runs is plenty.
const RESOURCE_QUEUE_HINT: usize = 2;

/// Process-wide map from resource key to its pinned worker.
pub struct ResourceWorkerRegistry {
    workers: Mutex<HashMap<String, CooperativeWorker>>,
}

impl ResourceWorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the worker pinned to `key`, creating it on first use.
    pub fn get_or_add(&self, key: &str) -> CooperativeWorker {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        workers
            .entry(key.to_string())
            .or_insert_with(|| CooperativeWorker::spawn(RESOURCE_QUEUE_HINT))
            .clone()
    }

    /// Stop every resource worker.
    pub fn shutdown(&self) {
        let workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for worker in workers.values() {
            worker.shutdown();
        }
    }
}

impl Default for ResourceWorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
