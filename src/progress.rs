//! Progress events and the lossy fan-out bus
//!
//! Every decision point of a run emits a [`ProgressUpdate`]. Delivery has two
//! modes, chosen by the publisher: broadcast to every subscriber, or unicast
//! to a single registered client id. Delivery is lossy best-effort — a slow
//! subscriber must never back-pressure the transfer engine, so publishing
//! hands the payload to a bounded dispatcher task and drops it if the queue
//! is full.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};

/// Per-client delivery queue depth; slower clients lose updates beyond this.
const CLIENT_QUEUE_DEPTH: usize = 64;

/// Broadcast buffer; subscribers lagging further than this see `Lagged`.
const BROADCAST_BUFFER: usize = 1000;

/// State carried by a progress update
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    /// Work is proceeding
    Processing,
    /// A unit was intentionally skipped
    Skipped,
    /// A unit completed successfully
    Succeeded,
    /// A unit failed; the run continues
    Failed,
    /// The run is over (the only terminal state)
    Finished,
}

/// One progress event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Event state
    pub state: ProgressState,
    /// Optional short caption (e.g., the task name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Human-readable detail
    pub message: String,
    /// Bytes accounted for so far in this run; non-decreasing
    pub complete: u64,
    /// Total bytes planned so far in this run; `complete <= total`
    pub total: u64,
}

/// The wire payload: a device name plus one or more updates
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceProgress {
    /// Device acronym the updates belong to
    pub device: String,
    /// Updates, in emission order
    pub updates: Vec<ProgressUpdate>,
}

enum Envelope {
    Broadcast(DeviceProgress),
    Unicast(String, DeviceProgress),
}

/// Lossy progress fan-out with broadcast and per-client unicast delivery
#[derive(Clone)]
pub struct ProgressBus {
    dispatch_tx: mpsc::Sender<Envelope>,
    broadcast_tx: broadcast::Sender<DeviceProgress>,
    clients: Arc<RwLock<HashMap<String, mpsc::Sender<DeviceProgress>>>>,
}

impl ProgressBus {
    /// Create the bus and spawn its dispatcher task.
    pub fn new(queue_depth: usize) -> Self {
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(queue_depth.max(1));
        let (broadcast_tx, _rx) = broadcast::channel(BROADCAST_BUFFER);
        let clients: Arc<RwLock<HashMap<String, mpsc::Sender<DeviceProgress>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let dispatcher_broadcast = broadcast_tx.clone();
        let dispatcher_clients = clients.clone();
        tokio::spawn(async move {
            while let Some(envelope) = dispatch_rx.recv().await {
                match envelope {
                    Envelope::Broadcast(payload) => {
                        // send() errs only when nobody subscribes; fine to drop
                        dispatcher_broadcast.send(payload).ok();
                    }
                    Envelope::Unicast(client_id, payload) => {
                        let tx = dispatcher_clients
                            .read()
                            .ok()
                            .and_then(|map| map.get(&client_id).cloned());
                        if let Some(tx) = tx {
                            if tx.try_send(payload).is_err() && tx.is_closed() {
                                if let Ok(mut map) = dispatcher_clients.write() {
                                    map.remove(&client_id);
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            dispatch_tx,
            broadcast_tx,
            clients,
        }
    }

    /// Publish a single update to all subscribers.
    pub fn publish(&self, device: &str, update: ProgressUpdate) {
        self.publish_many(device, vec![update]);
    }

    /// Publish a batch of updates to all subscribers.
    pub fn publish_many(&self, device: &str, updates: Vec<ProgressUpdate>) {
        let payload = DeviceProgress {
            device: device.to_string(),
            updates,
        };
        // Lossy by design: a full dispatcher queue drops the update.
        self.dispatch_tx.try_send(Envelope::Broadcast(payload)).ok();
    }

    /// Publish a batch of updates to one registered client.
    pub fn publish_to(&self, client_id: &str, device: &str, updates: Vec<ProgressUpdate>) {
        let payload = DeviceProgress {
            device: device.to_string(),
            updates,
        };
        self.dispatch_tx
            .try_send(Envelope::Unicast(client_id.to_string(), payload))
            .ok();
    }

    /// Subscribe to the broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceProgress> {
        self.broadcast_tx.subscribe()
    }

    /// Register a unicast client and return its receiving end.
    ///
    /// Re-registering an id replaces the previous receiver.
    pub fn register_client(&self, client_id: &str) -> mpsc::Receiver<DeviceProgress> {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        if let Ok(mut map) = self.clients.write() {
            map.insert(client_id.to_string(), tx);
        }
        rx
    }

    /// Drop a unicast client registration.
    pub fn unregister_client(&self, client_id: &str) {
        if let Ok(mut map) = self.clients.write() {
            map.remove(client_id);
        }
    }
}

/// Byte-level progress accounting for one run.
///
/// `total` grows as tasks plan work; `complete` is pre-incremented before
/// each transfer attempt so an interruption can never move it backwards.
#[derive(Debug, Default)]
pub(crate) struct RunProgress {
    complete: u64,
    total: u64,
}

impl RunProgress {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add planned bytes to the run total.
    pub(crate) fn add_total(&mut self, bytes: u64) {
        self.total += bytes;
    }

    /// Account bytes as handled; clamped so `complete <= total` always holds.
    pub(crate) fn advance(&mut self, bytes: u64) {
        self.complete = (self.complete + bytes).min(self.total);
    }

    /// Force `complete == total` for terminal re-publication.
    pub(crate) fn finish(&mut self) {
        self.complete = self.total;
    }

    pub(crate) fn complete(&self) -> u64 {
        self.complete
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}
