//! The fleet downloader engine
//!
//! [`FleetDownloader`] wires the schedule clock, worker pool, resource
//! registry, progress bus, and status recorder together and owns the device
//! runners. Consumers register devices (each with its connection profile),
//! subscribe to progress, trigger manual runs, and eventually shut down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::exec::{ResourceWorkerRegistry, WorkerPool};
use crate::ftp::{FtpConnector, SuppaFtpConnector};
use crate::modem::{DialUpModem, NoModem};
use crate::notifier::{FileUpdateNotifier, NoOpNotifier};
use crate::progress::{DeviceProgress, ProgressBus};
use crate::runner::{DeviceRunner, RunnerContext};
use crate::schedule::ScheduleClock;
use crate::share_auth::{NoOpShareAuthenticator, ShareAuthenticator};
use crate::stats::StatisticsSnapshot;
use crate::status::{StatusRecorder, StatusStore};
use crate::types::{ConnectionProfile, Device};

/// The engine's external collaborators.
///
/// Every seam has a shipped default (see [`FleetDownloader::new`]); swap in
/// your own implementations to integrate an existing persistence layer, a
/// real modem driver, an SMTP sender, or a different transport.
pub struct Collaborators {
    /// Terminal-outcome persistence
    pub status_store: Arc<dyn StatusStore>,
    /// FTP transport
    pub ftp: Arc<dyn FtpConnector>,
    /// Dial-up modem driver
    pub modem: Arc<dyn DialUpModem>,
    /// Network-share credential establishment
    pub share_auth: Arc<dyn ShareAuthenticator>,
    /// Per-file update notifications
    pub notifier: Arc<dyn FileUpdateNotifier>,
}

/// Fleet-wide scheduled file-retrieval engine.
pub struct FleetDownloader {
    ctx: Arc<RunnerContext>,
    pool: Arc<WorkerPool>,
    registry: Arc<ResourceWorkerRegistry>,
    runners: Arc<RwLock<HashMap<String, Arc<DeviceRunner>>>>,
    clock: Arc<ScheduleClock>,
    cancel: CancellationToken,
}

impl FleetDownloader {
    /// Create an engine with the shipped collaborators: the sqlite status
    /// store at `config.database_path`, the suppaftp transport, no modem,
    /// no-op share auth, and no-op notifications.
    pub async fn new(config: Config) -> Result<Self> {
        let database = Database::new(&config.database_path).await?;
        let collaborators = Collaborators {
            status_store: Arc::new(database),
            ftp: Arc::new(SuppaFtpConnector),
            modem: Arc::new(NoModem),
            share_auth: Arc::new(NoOpShareAuthenticator),
            notifier: Arc::new(NoOpNotifier),
        };
        Self::with_collaborators(config, collaborators)
    }

    /// Create an engine over caller-supplied collaborators.
    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        let cancel = CancellationToken::new();
        let bus = ProgressBus::new(config.progress_queue_depth);
        let recorder = Arc::new(StatusRecorder::new(collaborators.status_store, &config));
        let pool = Arc::new(WorkerPool::new(config.ftp_thread_count));
        let registry = Arc::new(ResourceWorkerRegistry::new());

        let ctx = Arc::new(RunnerContext {
            config: Arc::new(config),
            bus,
            recorder,
            ftp: collaborators.ftp,
            modem: collaborators.modem,
            share_auth: collaborators.share_auth,
            notifier: collaborators.notifier,
        });

        let runners: Arc<RwLock<HashMap<String, Arc<DeviceRunner>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let (clock, mut due_rx) = ScheduleClock::new(cancel.child_token());
        let clock = Arc::new(clock);
        tokio::spawn(clock.clone().run());

        // Due events become queued runs; the run-once wrapper coalesces any
        // backlog from catch-up firing.
        let dispatch_runners = runners.clone();
        tokio::spawn(async move {
            while let Some(due) = due_rx.recv().await {
                let runner = dispatch_runners
                    .read()
                    .ok()
                    .and_then(|map| map.get(&due.name).cloned());
                match runner {
                    Some(runner) => runner.queue_run(),
                    None => {
                        tracing::debug!(schedule = %due.name, "due event for unregistered device");
                    }
                }
            }
        });

        Ok(Self {
            ctx,
            pool,
            registry,
            runners,
            clock,
            cancel,
        })
    }

    /// Register a device with its connection profile.
    ///
    /// The connection string, every task's settings, and the schedule are
    /// parsed here; any parse failure is fatal to registration and leaves the
    /// device out of the fleet until the next reload. Re-registering an
    /// acronym replaces (and cancels) the previous runner.
    pub fn register_device(&self, device: Device, profile: ConnectionProfile) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let acronym = device.acronym.clone();
        let enabled = device.enabled;
        let runner = match DeviceRunner::new(
            device,
            profile,
            self.ctx.clone(),
            &self.pool,
            &self.registry,
            &self.cancel,
        ) {
            Ok(runner) => runner,
            Err(e) => {
                tracing::warn!(device = %acronym, error = %e, "device registration failed");
                return Err(e);
            }
        };

        if enabled {
            if let Err(e) = self
                .clock
                .add_schedule(&acronym, runner.schedule_expression())
            {
                tracing::warn!(device = %acronym, error = %e, "bad schedule expression");
                runner.cancel();
                return Err(e);
            }
        }

        let previous = match self.runners.write() {
            Ok(mut map) => map.insert(acronym.clone(), runner),
            Err(poisoned) => poisoned.into_inner().insert(acronym.clone(), runner),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        tracing::info!(device = %acronym, enabled, "device registered");
        Ok(())
    }

    /// Remove a device: cancels its runner and unschedules it.
    pub fn deregister_device(&self, acronym: &str) -> Result<()> {
        self.clock.remove_schedule(acronym);
        let removed = match self.runners.write() {
            Ok(mut map) => map.remove(acronym),
            Err(poisoned) => poisoned.into_inner().remove(acronym),
        };
        match removed {
            Some(runner) => {
                runner.cancel();
                tracing::info!(device = %acronym, "device deregistered");
                Ok(())
            }
            None => Err(Error::NotFound(format!("device {acronym}"))),
        }
    }

    /// Trigger a run for one device and wait for it to finish.
    pub async fn run_now(&self, acronym: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let runner = self
            .runner(acronym)
            .ok_or_else(|| Error::NotFound(format!("device {acronym}")))?;
        runner.run_now().await;
        Ok(())
    }

    /// Queue a run for one device without waiting.
    pub fn queue_run(&self, acronym: &str) -> Result<()> {
        let runner = self
            .runner(acronym)
            .ok_or_else(|| Error::NotFound(format!("device {acronym}")))?;
        runner.queue_run();
        Ok(())
    }

    /// Subscribe to the broadcast progress stream.
    pub fn subscribe_progress(&self) -> tokio::sync::broadcast::Receiver<DeviceProgress> {
        self.ctx.bus.subscribe()
    }

    /// Register a unicast progress client and return its receiver.
    pub fn register_progress_client(
        &self,
        client_id: &str,
    ) -> tokio::sync::mpsc::Receiver<DeviceProgress> {
        self.ctx.bus.register_client(client_id)
    }

    /// Drop a unicast progress client.
    pub fn unregister_progress_client(&self, client_id: &str) {
        self.ctx.bus.unregister_client(client_id);
    }

    /// Statistics for one device, if registered.
    pub fn statistics(&self, acronym: &str) -> Option<StatisticsSnapshot> {
        self.runner(acronym)
            .map(|runner| runner.stats().snapshot(runner.device().enabled))
    }

    /// Acronyms of every registered device.
    pub fn devices(&self) -> Vec<String> {
        match self.runners.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    /// Stop the engine: cancels every runner, the clock, and the workers.
    /// Operations already in flight finish; queued ones are discarded.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("engine shutting down");
        self.cancel.cancel();
        let runners: Vec<Arc<DeviceRunner>> = match self.runners.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for runner in runners {
            runner.cancel();
        }
        self.pool.shutdown();
        self.registry.shutdown();
        Ok(())
    }

    fn runner(&self, acronym: &str) -> Option<Arc<DeviceRunner>> {
        match self.runners.read() {
            Ok(map) => map.get(acronym).cloned(),
            Err(poisoned) => poisoned.into_inner().get(acronym).cloned(),
        }
    }

    #[cfg(test)]
    pub(crate) fn clock(&self) -> &ScheduleClock {
        &self.clock
    }
}
