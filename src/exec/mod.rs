//! Cooperative execution primitives
//!
//! Device runs execute on *cooperative workers*: long-lived tasks draining a
//! FIFO of queued operations with at-most-one-in-flight semantics. The
//! submodules compose into the engine's concurrency model:
//!
//! - [`worker`] - the FIFO worker itself, with two-level priority and an
//!   unhandled-error channel
//! - [`pool`] - a bounded pool handing out workers round-robin
//! - [`registry`] - per-resource worker pinning (one modem, one worker)
//! - [`run_once`] - the coalescing "run now" wrapper

mod pool;
mod registry;
mod run_once;
mod worker;

pub use pool::WorkerPool;
pub use registry::ResourceWorkerRegistry;
pub use run_once::RunOnceOperation;
pub use worker::{CooperativeWorker, Operation, OperationFuture, OperationPriority};
