//! External-operation tasks
//!
//! Instead of an FTP transfer, a task may launch an external tool that knows
//! how to pull the device's files itself. The engine supervises the child:
//! stdout/stderr output and filesystem activity in the task's local directory
//! both count as liveness, and the child (with its whole descendant tree) is
//! killed when cancellation fires or no activity is seen for the configured
//! timeout. Files that appear in the directory are counted as downloads.

use chrono::Local;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::TaskRun;
use crate::progress::{ProgressState, RunProgress};
use crate::templating;

/// Supervision poll period.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run one external-operation task.
pub(crate) async fn run_external_task(run: &TaskRun<'_>, progress: &mut RunProgress) -> crate::error::Result<()> {
    let local_root = run.local_root();
    let device_folder_path = local_root.join(run.device.folder_name());
    let ctx = run.template_context(Local::now(), &device_folder_path);

    let command_line = templating::expand(&run.settings.external_operation, &ctx);
    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else {
        run.emit(ProgressState::Failed, "external operation is empty", progress);
        return Ok(());
    };
    let args: Vec<&str> = parts.collect();
    let program = resolve_program(program);

    if let Err(e) = std::fs::create_dir_all(&local_root) {
        let message = format!("cannot create {}: {e}", local_root.display());
        run.emit(ProgressState::Failed, message.clone(), progress);
        run.recorder.record_failure(run.device.id, &message).await;
        return Ok(());
    }
    let before = snapshot_files(&local_root);

    run.emit(
        ProgressState::Processing,
        format!("running {command_line}"),
        progress,
    );

    let mut command = tokio::process::Command::new(&program);
    command
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("cannot launch {}: {e}", program.display());
            tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
            run.emit(ProgressState::Failed, message.clone(), progress);
            run.recorder.record_failure(run.device.id, &message).await;
            return Ok(());
        }
    };

    // Any stdio line or filesystem event in the local directory counts as
    // activity and pushes the inactivity deadline out.
    let last_activity = Arc::new(Mutex::new(Instant::now()));
    spawn_stdio_reader(child.stdout.take(), last_activity.clone(), "stdout");
    spawn_stdio_reader(child.stderr.take(), last_activity.clone(), "stderr");
    let _watcher = spawn_directory_watch(&local_root, last_activity.clone());

    let timeout = run.settings.external_operation_timeout;
    let mut forced_failure: Option<String> = None;
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                forced_failure = Some(format!("cannot supervise child: {e}"));
                kill_process_tree(&mut child).await;
                break None;
            }
        }

        if run.cancel.is_cancelled() {
            kill_process_tree(&mut child).await;
            break None;
        }

        let idle = last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default();
        if idle > timeout {
            forced_failure = Some(format!(
                "external operation exceeded timeout of {} s with no activity",
                timeout.as_secs()
            ));
            kill_process_tree(&mut child).await;
            break None;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    };

    // Whatever the outcome, files that appeared still count.
    let after = snapshot_files(&local_root);
    let new_files = after.difference(&before).count() as u64;
    if new_files > 0 {
        run.stats.record_collected_files(new_files);
    }

    if let Some(message) = forced_failure {
        tracing::warn!(device = %run.device.acronym, task = %run.task.name, "{message}");
        run.emit(ProgressState::Failed, message.clone(), progress);
        run.recorder.record_failure(run.device.id, &message).await;
        return Ok(());
    }

    match exit_status {
        Some(status) if status.success() => {
            run.emit(
                ProgressState::Succeeded,
                format!("external operation finished, {new_files} new files"),
                progress,
            );
        }
        Some(status) => {
            // A non-zero exit is recorded but is not a run failure.
            run.emit(
                ProgressState::Processing,
                format!("external operation exited with {status}, {new_files} new files"),
                progress,
            );
        }
        // Killed by cancellation: the runner emits the terminal event.
        None => {}
    }
    Ok(())
}

fn resolve_program(program: &str) -> PathBuf {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return PathBuf::from(program);
    }
    which::which(program).unwrap_or_else(|_| PathBuf::from(program))
}

fn snapshot_files(dir: &Path) -> HashSet<PathBuf> {
    let mut files = HashSet::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.insert(entry.path());
            }
        }
    }
    files
}

fn spawn_stdio_reader(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    last_activity: Arc<Mutex<Instant>>,
    label: &'static str,
) {
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut at) = last_activity.lock() {
                *at = Instant::now();
            }
            tracing::debug!(stream = label, "{line}");
        }
    });
}

/// Watch the local directory; any event refreshes the activity timestamp.
/// The returned watcher must stay alive for the duration of the supervision.
fn spawn_directory_watch(
    dir: &Path,
    last_activity: Arc<Mutex<Instant>>,
) -> Option<notify::RecommendedWatcher> {
    use notify::Watcher;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = match notify::RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                tx.send(()).ok();
            }
        },
        notify::Config::default(),
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(error = %e, "cannot create directory watcher, relying on stdio activity");
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, notify::RecursiveMode::Recursive) {
        tracing::warn!(dir = %dir.display(), error = %e, "cannot watch directory");
        return None;
    }

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Ok(mut at) = last_activity.lock() {
                *at = Instant::now();
            }
        }
    });
    Some(watcher)
}

/// Kill the child and its entire descendant tree.
async fn kill_process_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was placed in its own process group at spawn, so the
        // negative-pid signal reaches every descendant.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    child.kill().await.ok();
    child.wait().await.ok();
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use crate::progress::ProgressState;
    use crate::test_support::{TestHarness, collect_until_finished, single_task_profile, test_device};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn silent_external_operation_is_killed_on_inactivity_timeout() {
        let harness = TestHarness::new();
        let runner = harness.runner(
            test_device("SHELBY"),
            single_task_profile("externalOperation=sleep 60; externalOperationTimeout=1"),
        );

        let mut rx = harness.ctx.bus.subscribe();
        let started = Instant::now();
        runner.clone().execute_run().await.unwrap();
        let elapsed = started.elapsed();
        let updates = collect_until_finished(&mut rx).await;

        assert!(
            elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(10),
            "kill should land shortly after the timeout, took {elapsed:?}"
        );
        assert!(
            updates
                .iter()
                .any(|u| u.state == ProgressState::Failed
                    && u.message.contains("exceeded timeout")),
            "the timeout must be reported as a failure"
        );
        assert!(updates.iter().any(|u| u.state == ProgressState::Finished));
    }

    #[tokio::test]
    async fn files_created_by_the_tool_are_counted() {
        let harness = TestHarness::new();
        let made = harness.temp.path().join("made.dat");
        let runner = harness.runner(
            test_device("SHELBY"),
            single_task_profile(&format!(
                "externalOperation=touch {}; externalOperationTimeout=10",
                made.display()
            )),
        );

        let mut rx = harness.ctx.bus.subscribe();
        runner.clone().execute_run().await.unwrap();
        let updates = collect_until_finished(&mut rx).await;

        assert!(made.exists());
        assert_eq!(runner.stats().files_downloaded(), 1);
        assert!(updates.iter().any(|u| u.state == ProgressState::Succeeded));
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded_but_not_a_failure() {
        let harness = TestHarness::new();
        let runner = harness.runner(
            test_device("SHELBY"),
            single_task_profile("externalOperation=false; externalOperationTimeout=10"),
        );

        let mut rx = harness.ctx.bus.subscribe();
        runner.clone().execute_run().await.unwrap();
        let updates = collect_until_finished(&mut rx).await;

        assert!(
            updates
                .iter()
                .any(|u| u.state == ProgressState::Processing && u.message.contains("exited with")),
        );
        assert!(
            !updates.iter().any(|u| u.state == ProgressState::Failed),
            "a non-zero exit alone is not a failure"
        );
    }
}
