//! Device runner: per-device state and one full profile execution
//!
//! One runner exists per registered device. At registration it parses the
//! device's connection string and every task's settings (a parse failure is
//! fatal to initialization and leaves the device unregistered until the next
//! reload), and picks its execution strategy once:
//!
//! | configuration | worker |
//! |---|---|
//! | dial-up | the worker pinned to the dial-up entry name |
//! | pooled | a worker from the bounded pool |
//! | pool disabled | a private long-running worker |
//!
//! Triggers go through a coalescing run-once wrapper, so any volume of
//! schedule firings and manual requests produces at most one queued run.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::exec::{
    CooperativeWorker, OperationPriority, ResourceWorkerRegistry, RunOnceOperation, WorkerPool,
};
use crate::ftp::{FtpConnector, FtpSession};
use crate::modem::DialUpModem;
use crate::notifier::FileUpdateNotifier;
use crate::progress::{ProgressBus, ProgressState, ProgressUpdate, RunProgress};
use crate::share_auth::ShareAuthenticator;
use crate::stats::RuntimeStats;
use crate::status::StatusRecorder;
use crate::transfer::{self, TaskRun};
use crate::types::{ConnectionProfileTask, Device, DeviceSettings, TaskSettings};
use crate::utils;

/// Collaborators shared by every runner.
pub(crate) struct RunnerContext {
    pub config: Arc<Config>,
    pub bus: ProgressBus,
    pub recorder: Arc<StatusRecorder>,
    pub ftp: Arc<dyn FtpConnector>,
    pub modem: Arc<dyn DialUpModem>,
    pub share_auth: Arc<dyn ShareAuthenticator>,
    pub notifier: Arc<dyn FileUpdateNotifier>,
}

/// Per-device runner.
pub struct DeviceRunner {
    device: Device,
    settings: DeviceSettings,
    profile_name: String,
    tasks: Vec<(ConnectionProfileTask, TaskSettings)>,
    stats: Arc<RuntimeStats>,
    run_once: RunOnceOperation,
    cancel: CancellationToken,
    ctx: Arc<RunnerContext>,
}

impl DeviceRunner {
    /// Build a runner, selecting its worker by configuration.
    pub(crate) fn new(
        device: Device,
        profile: crate::types::ConnectionProfile,
        ctx: Arc<RunnerContext>,
        pool: &WorkerPool,
        registry: &ResourceWorkerRegistry,
        parent_cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let settings = DeviceSettings::parse(&device.connection_string)?;
        let mut tasks = Vec::with_capacity(profile.tasks.len());
        for task in profile.tasks {
            let task_settings = TaskSettings::parse(&task.settings)?;
            tasks.push((task, task_settings));
        }

        let worker: CooperativeWorker = if settings.use_dial_up {
            registry.get_or_add(&settings.dial_up_entry_name)
        } else {
            pool.create_worker()
        };

        let profile_name = profile.name;
        let cancel = parent_cancel.child_token();

        Ok(Arc::new_cyclic(|weak: &Weak<DeviceRunner>| {
            let weak = weak.clone();
            let factory: Arc<
                dyn Fn() -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync,
            > = Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(runner) => runner.execute_run().await,
                        None => Ok(()),
                    }
                })
            });
            let run_once = RunOnceOperation::new(worker, factory);

            DeviceRunner {
                device,
                settings,
                profile_name,
                tasks,
                stats: Arc::new(RuntimeStats::new()),
                run_once,
                cancel,
                ctx,
            }
        }))
    }

    /// The device this runner manages.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The device's cron expression.
    pub fn schedule_expression(&self) -> &str {
        &self.settings.schedule
    }

    /// The device's runtime counters.
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Queue a scheduled run; coalesced with any run already pending.
    pub fn queue_run(&self) {
        self.run_once.set_priority(OperationPriority::Normal);
        self.run_once.run_once_async();
    }

    /// Trigger a run manually and wait for a covering run to finish.
    ///
    /// The connection-attempt counter is incremented up front, before the
    /// execution mode is considered; the run itself increments it again when
    /// the session opens. Long-standing behavior, kept as-is.
    pub async fn run_now(&self) {
        self.stats.record_connection_attempt();
        if self.settings.use_dial_up {
            self.run_once.set_priority(OperationPriority::High);
        }
        self.run_once.run_once().await;
    }

    /// Cancel this runner's current and future work.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Execute one full run of the profile.
    pub(crate) async fn execute_run(self: Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        self.stats.begin_run();
        self.stats.set_overall_tasks(self.tasks.len() as u64);
        let mut progress = RunProgress::new();
        tracing::info!(device = %self.device.acronym, profile = %self.profile_name, "run started");

        // Dial-up bracket: a failed dial ends the run before any task.
        let mut dial_started: Option<Instant> = None;
        if self.settings.use_dial_up {
            self.stats.record_dial_up_attempt();
            let dialed = self
                .ctx
                .modem
                .dial(
                    &self.settings.dial_up_entry_name,
                    &self.settings.dial_up_number,
                    &self.settings.username,
                    &self.settings.password,
                    self.settings.dial_up_timeout,
                )
                .await;
            match dialed {
                Ok(()) => {
                    self.stats.record_dial_up_success();
                    dial_started = Some(Instant::now());
                }
                Err(e) => {
                    self.stats.record_dial_up_failure();
                    let message = format!(
                        "dial of {} failed: {e}",
                        self.settings.dial_up_entry_name
                    );
                    tracing::warn!(device = %self.device.acronym, "{message}");
                    self.emit(ProgressState::Failed, &message, &progress);
                    self.ctx.recorder.record_failure(self.device.id, &message).await;
                    if let Err(e) = self
                        .ctx
                        .modem
                        .hang_up(&self.settings.dial_up_entry_name)
                        .await
                    {
                        tracing::warn!(device = %self.device.acronym, error = %e, "hang-up failed");
                    }
                    self.emit(ProgressState::Finished, "run finished", &progress);
                    return Ok(());
                }
            }
        }

        self.authenticate_shares(&progress);

        let (ftp_tasks, external_tasks): (Vec<_>, Vec<_>) = self
            .tasks
            .iter()
            .partition(|(_, settings)| !settings.is_external());

        // One session per run, opened lazily only when FTP tasks exist. A
        // connect failure aborts the FTP tasks but not the external ones.
        let mut session: Option<Box<dyn FtpSession>> = None;
        let mut connected_at: Option<Instant> = None;
        if !ftp_tasks.is_empty() && !self.cancel.is_cancelled() {
            self.stats.record_connection_attempt();
            match self.ctx.ftp.connect(&self.settings).await {
                Ok(opened) => {
                    self.stats.record_connection_success();
                    session = Some(opened);
                    connected_at = Some(Instant::now());
                }
                Err(e) => {
                    self.stats.record_connection_failure();
                    let message = format!("connection to {} failed: {e}", self.settings.host);
                    tracing::warn!(device = %self.device.acronym, "{message}");
                    self.emit(ProgressState::Failed, &message, &progress);
                    self.ctx.recorder.record_failure(self.device.id, &message).await;
                }
            }
        }

        if let Some(open) = session.as_mut() {
            for (task, task_settings) in &ftp_tasks {
                if self.cancel.is_cancelled() {
                    break;
                }
                let run = self.task_run(task, task_settings);
                if let Err(e) = transfer::run_ftp_task(&run, open, &mut progress).await {
                    tracing::warn!(
                        device = %self.device.acronym,
                        task = %task.name,
                        error = %e,
                        "task aborted unexpectedly"
                    );
                    self.emit(
                        ProgressState::Failed,
                        &format!("task {} aborted: {e}", task.name),
                        &progress,
                    );
                }
                self.finish_task(task_settings, &progress);
            }
        }

        for (task, task_settings) in &external_tasks {
            if self.cancel.is_cancelled() {
                break;
            }
            let run = self.task_run(task, task_settings);
            if let Err(e) = transfer::external::run_external_task(&run, &mut progress).await {
                tracing::warn!(
                    device = %self.device.acronym,
                    task = %task.name,
                    error = %e,
                    "external task aborted unexpectedly"
                );
                self.emit(
                    ProgressState::Failed,
                    &format!("task {} aborted: {e}", task.name),
                    &progress,
                );
            }
            self.finish_task(task_settings, &progress);
        }

        if let Some(mut open) = session.take() {
            if let Err(e) = open.close().await {
                tracing::warn!(device = %self.device.acronym, error = %e, "session close failed");
            }
            if let Some(connected_at) = connected_at {
                self.stats.record_connected_time(connected_at.elapsed());
            }
        }

        progress.finish();
        self.emit(ProgressState::Finished, "run finished", &progress);

        if self.settings.use_dial_up {
            if let Err(e) = self
                .ctx
                .modem
                .hang_up(&self.settings.dial_up_entry_name)
                .await
            {
                tracing::warn!(device = %self.device.acronym, error = %e, "hang-up failed");
            }
            if let Some(dial_started) = dial_started {
                self.stats.record_dial_up_time(dial_started.elapsed());
            }
        }

        tracing::info!(
            device = %self.device.acronym,
            files = self.stats.files_downloaded(),
            "run finished"
        );
        Ok(())
    }

    /// Authenticate each distinct share path once; failure is a warning.
    fn authenticate_shares(&self, progress: &RunProgress) {
        let mut authenticated: HashSet<PathBuf> = HashSet::new();
        for (_, task_settings) in &self.tasks {
            if task_settings.directory_auth_user_name.is_empty() {
                continue;
            }
            let root = local_root(&self.ctx.config, task_settings);
            if !authenticated.insert(root.clone()) {
                continue;
            }
            if let Err(e) = self.ctx.share_auth.authenticate(
                &root,
                &task_settings.directory_auth_user_name,
                &task_settings.directory_auth_password,
            ) {
                let message = format!("share authentication for {} failed: {e}", root.display());
                tracing::warn!(device = %self.device.acronym, "{message}");
                self.emit(ProgressState::Failed, &message, progress);
            }
        }
    }

    /// Post-task bookkeeping: optional local purge, anchors, progress event.
    fn finish_task(&self, task_settings: &TaskSettings, progress: &RunProgress) {
        if task_settings.delete_old_local_files {
            let root = local_root(&self.ctx.config, task_settings);
            match utils::purge_files_older_than(
                &root,
                self.ctx.config.max_local_file_age,
                chrono::Utc::now(),
            ) {
                Ok(removed) if removed > 0 => {
                    tracing::info!(device = %self.device.acronym, removed, "purged old local files");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(device = %self.device.acronym, error = %e, "local purge failed");
                }
            }
        }

        self.stats.record_task_completed();
        let (completed, count) = self.stats.task_progress();
        self.emit(
            ProgressState::Processing,
            &format!("completed task {completed} of {count}"),
            progress,
        );
    }

    fn task_run<'a>(
        &'a self,
        task: &'a ConnectionProfileTask,
        task_settings: &'a TaskSettings,
    ) -> TaskRun<'a> {
        TaskRun {
            device: &self.device,
            profile_name: &self.profile_name,
            task,
            settings: task_settings,
            config: &self.ctx.config,
            stats: &self.stats,
            recorder: &self.ctx.recorder,
            bus: &self.ctx.bus,
            notifier: self.ctx.notifier.clone(),
            cancel: &self.cancel,
        }
    }

    fn emit(&self, state: ProgressState, message: &str, progress: &RunProgress) {
        self.ctx.bus.publish(
            &self.device.acronym,
            ProgressUpdate {
                state,
                summary: None,
                message: message.to_string(),
                complete: progress.complete(),
                total: progress.total(),
            },
        );
    }
}

fn local_root(config: &Config, settings: &TaskSettings) -> PathBuf {
    if settings.local_path.is_empty() {
        config.default_local_path.clone()
    } else {
        PathBuf::from(&settings.local_path)
    }
}
