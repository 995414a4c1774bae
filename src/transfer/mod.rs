//! Transfer engine: the per-task state machine
//!
//! One FTP task moves through prepare → enumerate → plan → transfer → finish:
//!
//! - **prepare** expands the directory-naming expression and creates the
//!   local target directory;
//! - **enumerate** walks the remote tree (depth-first, skipping dot-named
//!   directories) applying the pattern, age, size, and skip-if-unchanged
//!   filters in that order;
//! - **plan** groups survivors by destination directory; a directory that
//!   cannot be created skips its whole group while still advancing progress
//!   by the group's byte total, keeping progress monotone;
//! - **transfer** pre-accounts each file's bytes before attempting the get,
//!   then archives, skips, or downloads, synchronizes timestamps, records
//!   status, optionally deletes the remote copy, and dispatches
//!   notifications. A per-file failure never fails the task;
//! - **finish** emits the task's closing event.
//!
//! Cancellation is checked before every listing, every group, and every file;
//! when it fires the engine returns early and the runner emits the terminal
//! event.
//!
//! External-operation tasks bypass all of this; see [`external`].

pub(crate) mod external;

use chrono::{DateTime, Local, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::ftp::FtpSession;
use crate::notifier::FileUpdateNotifier;
use crate::progress::{ProgressBus, ProgressState, ProgressUpdate, RunProgress};
use crate::stats::RuntimeStats;
use crate::status::StatusRecorder;
use crate::templating::{self, TemplateContext};
use crate::types::{ConnectionProfileTask, Device, RemoteEntry, RemoteFile, TaskSettings};
use crate::utils;

/// Everything a task execution needs from its surrounding run.
pub(crate) struct TaskRun<'a> {
    pub device: &'a Device,
    pub profile_name: &'a str,
    pub task: &'a ConnectionProfileTask,
    pub settings: &'a TaskSettings,
    pub config: &'a Config,
    pub stats: &'a RuntimeStats,
    pub recorder: &'a StatusRecorder,
    pub bus: &'a ProgressBus,
    pub notifier: Arc<dyn FileUpdateNotifier>,
    pub cancel: &'a CancellationToken,
}

impl TaskRun<'_> {
    /// The task's local root: its own path, or the global default.
    pub(crate) fn local_root(&self) -> PathBuf {
        if self.settings.local_path.is_empty() {
            self.config.default_local_path.clone()
        } else {
            PathBuf::from(&self.settings.local_path)
        }
    }

    fn template_context<'b>(
        &'b self,
        now: DateTime<Local>,
        device_folder_path: &'b Path,
    ) -> TemplateContext<'b> {
        TemplateContext {
            now,
            device: self.device,
            profile_name: self.profile_name,
            task_id: self.task.id,
            device_folder_path,
        }
    }

    fn emit(&self, state: ProgressState, message: impl Into<String>, progress: &RunProgress) {
        self.bus.publish(
            &self.device.acronym,
            ProgressUpdate {
                state,
                summary: Some(self.task.name.clone()),
                message: message.into(),
                complete: progress.complete(),
                total: progress.total(),
            },
        );
    }
}

/// A remote file that survived every filter, mapped to its destination.
struct PlannedFile {
    remote: RemoteFile,
    remote_path: String,
    dest_dir: PathBuf,
    local_path: PathBuf,
}

/// Run one FTP task end to end. Infrastructure errors surface as `Err`; task
/// and file failures are handled internally per the error policy.
pub(crate) async fn run_ftp_task(
    run: &TaskRun<'_>,
    session: &mut Box<dyn FtpSession>,
    progress: &mut RunProgress,
) -> Result<()> {
    let now = Local::now();
    let local_root = run.local_root();
    let device_folder_path = local_root.join(run.device.folder_name());
    let ctx = run.template_context(now, &device_folder_path);

    // Prepare: resolve and create the local target directory.
    let dir_expression = templating::expand(&run.settings.directory_naming_expression, &ctx);
    let target_dir = local_root.join(templating::expanded_to_path(&dir_expression));
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        let message = format!("cannot create {}: {e}", target_dir.display());
        tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
        run.emit(ProgressState::Failed, message.clone(), progress);
        run.recorder.record_failure(run.device.id, &message).await;
        return Ok(());
    }

    // Enumerate: set the working directory and walk the remote tree.
    let remote_root = templating::expand(&run.settings.remote_path, &ctx);
    if let Err(e) = session.set_working_dir(&remote_root).await {
        let message = format!("cannot open remote directory {remote_root}: {e}");
        tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
        run.emit(ProgressState::Failed, message.clone(), progress);
        run.recorder.record_failure(run.device.id, &message).await;
        return Ok(());
    }

    let planned = enumerate(run, session, &target_dir, progress).await?;
    if run.cancel.is_cancelled() {
        return Ok(());
    }

    // Plan: group by destination directory and account the byte totals.
    let mut groups: BTreeMap<PathBuf, Vec<PlannedFile>> = BTreeMap::new();
    for file in planned {
        groups.entry(file.dest_dir.clone()).or_default().push(file);
    }
    let planned_bytes: u64 = groups
        .values()
        .flatten()
        .map(|file| file.remote.size)
        .sum();
    progress.add_total(planned_bytes);

    for (dest_dir, files) in groups {
        if run.cancel.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = std::fs::create_dir_all(&dest_dir) {
            // The whole group is skipped; progress still advances by its
            // total so it stays monotone.
            let group_bytes: u64 = files.iter().map(|f| f.remote.size).sum();
            progress.advance(group_bytes);
            let message = format!(
                "cannot create {}: {e}; skipping {} files",
                dest_dir.display(),
                files.len()
            );
            tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
            run.emit(ProgressState::Failed, message.clone(), progress);
            run.recorder.record_failure(run.device.id, &message).await;
            continue;
        }

        for file in files {
            if run.cancel.is_cancelled() {
                return Ok(());
            }
            if threshold_exceeded(run) {
                run.emit(
                    ProgressState::Failed,
                    "download threshold exceeded for the current window",
                    progress,
                );
                return Ok(());
            }
            transfer_one(run, session, file, progress).await;
        }
    }

    // Finish: the task's closing event. Succeeded/Failed stay per-file.
    run.emit(
        ProgressState::Processing,
        format!("task {} complete", run.task.name),
        progress,
    );
    Ok(())
}

/// Walk the remote tree depth-first, applying the filters in order.
async fn enumerate(
    run: &TaskRun<'_>,
    session: &mut Box<dyn FtpSession>,
    target_dir: &Path,
    progress: &mut RunProgress,
) -> Result<Vec<PlannedFile>> {
    let specs = match utils::compile_file_specs(&run.settings.file_specs()) {
        Ok(specs) => specs,
        Err(e) => {
            let message = format!("bad file specs: {e}");
            run.emit(ProgressState::Failed, message.clone(), progress);
            run.recorder.record_failure(run.device.id, &message).await;
            return Ok(Vec::new());
        }
    };

    let now = Utc::now();
    let mut planned = Vec::new();
    let mut stack: Vec<(String, PathBuf)> = vec![(String::new(), PathBuf::new())];

    while let Some((remote_dir, relative)) = stack.pop() {
        if run.cancel.is_cancelled() {
            return Ok(planned);
        }

        let entries = match session.list(&remote_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                // Scoped warning: siblings proceed.
                let shown = if remote_dir.is_empty() {
                    "."
                } else {
                    remote_dir.as_str()
                };
                let message = format!("listing {shown} failed: {e}");
                tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
                run.emit(ProgressState::Failed, message, progress);
                continue;
            }
        };

        for entry in entries {
            match entry {
                RemoteEntry::Directory(name) => {
                    if run.settings.recursive_download && !name.starts_with('.') {
                        stack.push((join_remote(&remote_dir, &name), relative.join(&name)));
                    }
                }
                RemoteEntry::File(file) => {
                    if !utils::matches_any(&specs, &file.name) {
                        continue;
                    }
                    if run.settings.limit_remote_file_download_by_age
                        && (now - file.modified).num_days() > run.config.max_remote_file_age
                    {
                        run.emit(
                            ProgressState::Skipped,
                            format!(
                                "{} is older than {} days",
                                file.name, run.config.max_remote_file_age
                            ),
                            progress,
                        );
                        continue;
                    }
                    let size_limit = (run.settings.maximum_file_size * 1_000_000.0) as u64;
                    if file.size > size_limit {
                        run.emit(
                            ProgressState::Skipped,
                            format!("{} exceeds {} MB", file.name, run.settings.maximum_file_size),
                            progress,
                        );
                        continue;
                    }

                    let dest_dir = target_dir.join(&relative);
                    let local_path = dest_dir.join(&file.name);
                    if run.settings.skip_download_if_unchanged
                        && is_unchanged(&local_path, &file, run.settings.synchronize_timestamps)
                    {
                        run.emit(
                            ProgressState::Skipped,
                            format!("{} is unchanged", file.name),
                            progress,
                        );
                        continue;
                    }

                    planned.push(PlannedFile {
                        remote_path: join_remote(&remote_dir, &file.name),
                        remote: file,
                        dest_dir,
                        local_path,
                    });
                }
            }
        }
    }

    if run.settings.maximum_file_count >= 0 {
        planned.truncate(run.settings.maximum_file_count as usize);
    }
    Ok(planned)
}

/// Transfer one planned file. Failures are per-file: reported, recorded, and
/// never fatal to the task.
async fn transfer_one(
    run: &TaskRun<'_>,
    session: &mut Box<dyn FtpSession>,
    file: PlannedFile,
    progress: &mut RunProgress,
) {
    // Pre-account before the attempt so an interruption cannot move the
    // run's progress backwards.
    progress.advance(file.remote.size);
    run.stats.record_processed_file();
    run.emit(
        ProgressState::Processing,
        format!("downloading {}", file.remote.name),
        progress,
    );

    if file.local_path.exists() {
        if run.settings.archive_existing_files_before_download {
            match utils::archive_existing_file(&file.local_path) {
                Ok(archived) => {
                    tracing::debug!(
                        device = %run.device.acronym,
                        file = %file.local_path.display(),
                        archived = %archived.display(),
                        "archived prior copy"
                    );
                }
                Err(e) => {
                    run.emit(
                        ProgressState::Failed,
                        format!("cannot archive {}: {e}", file.remote.name),
                        progress,
                    );
                }
            }
        }
        if file.local_path.exists() && !run.settings.overwrite_existing_local_files {
            run.emit(
                ProgressState::Skipped,
                format!("{} exists and overwrite is off", file.remote.name),
                progress,
            );
            return;
        }
    }

    match session
        .retrieve(&file.remote_path, &file.local_path, run.cancel)
        .await
    {
        Ok(_written) => {
            run.stats.record_downloaded_file(file.remote.size);
            if run.config.max_download_threshold > 0 {
                run.stats.add_window_bytes(file.remote.size, threshold_window(run.config));
            }

            if run.settings.synchronize_timestamps {
                if let Err(e) = sync_file_times(&file.local_path, file.remote.modified) {
                    run.emit(
                        ProgressState::Failed,
                        format!("cannot set timestamps on {}: {e}", file.remote.name),
                        progress,
                    );
                }
            }

            run.recorder
                .record_success(run.device.id, &file.local_path, file.remote.size)
                .await;

            if run.settings.delete_remote_files_after_download {
                if let Err(e) = session.delete(&file.remote_path).await {
                    run.emit(
                        ProgressState::Failed,
                        format!("cannot delete remote {}: {e}", file.remote_path),
                        progress,
                    );
                }
            }

            if run.settings.email_on_file_update {
                let recipients = run.settings.recipients();
                if !recipients.is_empty() {
                    let notifier = run.notifier.clone();
                    let device = run.device.acronym.clone();
                    let path = file.local_path.clone();
                    tokio::spawn(async move {
                        if let Err(e) = notifier.file_updated(&device, &path, &recipients).await {
                            tracing::warn!(device = %device, error = %e, "file-update notification failed");
                        }
                    });
                }
            }

            run.emit(
                ProgressState::Succeeded,
                format!("downloaded {}", file.remote.name),
                progress,
            );
        }
        Err(e) => {
            let message = format!("download of {} failed: {e}", file.remote_path);
            tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
            run.emit(ProgressState::Failed, message.clone(), progress);
            run.recorder.record_failure(run.device.id, &message).await;
        }
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Skip-if-unchanged comparison: same size, and same whole-second mtime when
/// timestamps are being synchronized.
fn is_unchanged(local_path: &Path, remote: &RemoteFile, compare_mtime: bool) -> bool {
    let Ok(metadata) = std::fs::metadata(local_path) else {
        return false;
    };
    if metadata.len() != remote.size {
        return false;
    }
    if !compare_mtime {
        return true;
    }
    match metadata.modified() {
        Ok(modified) => {
            let local: DateTime<Utc> = modified.into();
            local.timestamp() == remote.modified.timestamp()
        }
        Err(_) => false,
    }
}

fn sync_file_times(path: &Path, remote: DateTime<Utc>) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    let when: std::time::SystemTime = remote.into();
    file.set_times(
        std::fs::FileTimes::new()
            .set_accessed(when)
            .set_modified(when),
    )
}

fn threshold_window(config: &Config) -> std::time::Duration {
    std::time::Duration::from_secs(config.max_download_threshold_time_window * 3600)
}

fn threshold_exceeded(run: &TaskRun<'_>) -> bool {
    if run.config.max_download_threshold == 0 {
        return false;
    }
    let window_bytes = run.stats.add_window_bytes(0, threshold_window(run.config));
    window_bytes > run.config.max_download_threshold * 1_000_000
}
