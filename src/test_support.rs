//! Shared test doubles: scripted FTP server, recording modem, memory status
//! store, and collecting notifier, plus a harness that wires them into a
//! runner context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::{ResourceWorkerRegistry, WorkerPool};
use crate::ftp::{FtpConnector, FtpSession};
use crate::modem::DialUpModem;
use crate::notifier::FileUpdateNotifier;
use crate::progress::{DeviceProgress, ProgressBus, ProgressState};
use crate::runner::{DeviceRunner, RunnerContext};
use crate::share_auth::NoOpShareAuthenticator;
use crate::status::{NewDownloadedFile, StatusRecorder, StatusStore};
use crate::types::{ConnectionProfile, ConnectionProfileTask, Device, DeviceSettings, RemoteEntry, RemoteFile};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Scripted FTP server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockFtpState {
    dirs: HashMap<String, Vec<RemoteEntry>>,
    sizes: HashMap<String, u64>,
    fail_connect: bool,
    fail_list: HashSet<String>,
    fail_retrieve: HashSet<String>,
    fail_delete: bool,
    gets: Vec<String>,
    deletes: Vec<String>,
    connects: usize,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// In-memory FTP collaborator whose directory tree is scripted by the test.
#[derive(Clone)]
pub(crate) struct MockFtpServer {
    state: Arc<Mutex<MockFtpState>>,
}

impl MockFtpServer {
    pub(crate) fn new() -> Self {
        let mut state = MockFtpState::default();
        state.dirs.insert(String::new(), Vec::new());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn add_file(&self, dir: &str, name: &str, size: u64, modified: DateTime<Utc>) {
        let mut state = lock(&self.state);
        state
            .dirs
            .entry(dir.to_string())
            .or_default()
            .push(RemoteEntry::File(RemoteFile {
                name: name.to_string(),
                size,
                modified,
            }));
        let path = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        };
        state.sizes.insert(path, size);
    }

    pub(crate) fn add_dir(&self, parent: &str, name: &str) {
        let mut state = lock(&self.state);
        state
            .dirs
            .entry(parent.to_string())
            .or_default()
            .push(RemoteEntry::Directory(name.to_string()));
        let path = if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        };
        state.dirs.entry(path).or_default();
    }

    pub(crate) fn refuse_connections(&self) {
        lock(&self.state).fail_connect = true;
    }

    pub(crate) fn fail_listing(&self, dir: &str) {
        lock(&self.state).fail_list.insert(dir.to_string());
    }

    pub(crate) fn fail_retrieve(&self, path: &str) {
        lock(&self.state).fail_retrieve.insert(path.to_string());
    }

    pub(crate) fn fail_deletes(&self) {
        lock(&self.state).fail_delete = true;
    }

    pub(crate) fn gets(&self) -> Vec<String> {
        lock(&self.state).gets.clone()
    }

    pub(crate) fn deletes(&self) -> Vec<String> {
        lock(&self.state).deletes.clone()
    }

    pub(crate) fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    /// Fire `token` once the n-th retrieval has been recorded.
    pub(crate) fn cancel_after_gets(&self, n: usize, token: CancellationToken) {
        lock(&self.state).cancel_after = Some((n, token));
    }
}

#[async_trait]
impl FtpConnector for MockFtpServer {
    async fn connect(&self, _settings: &DeviceSettings) -> Result<Box<dyn FtpSession>> {
        let mut state = lock(&self.state);
        if state.fail_connect {
            return Err(Error::Ftp("mock server refused the connection".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(MockFtpSession {
            server: self.clone(),
        }))
    }
}

struct MockFtpSession {
    server: MockFtpServer,
}

#[async_trait]
impl FtpSession for MockFtpSession {
    async fn set_working_dir(&mut self, _dir: &str) -> Result<()> {
        Ok(())
    }

    async fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let state = lock(&self.server.state);
        if state.fail_list.contains(dir) {
            return Err(Error::Ftp(format!("mock listing failure for {dir:?}")));
        }
        state
            .dirs
            .get(dir)
            .cloned()
            .ok_or_else(|| Error::Ftp(format!("no such directory {dir:?}")))
    }

    async fn retrieve(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(Error::Ftp(format!("RETR {remote_path} cancelled")));
        }
        let size = {
            let mut state = lock(&self.server.state);
            if state.fail_retrieve.contains(remote_path) {
                return Err(Error::Ftp(format!("mock RETR failure for {remote_path}")));
            }
            let size = state
                .sizes
                .get(remote_path)
                .copied()
                .ok_or_else(|| Error::Ftp(format!("no such file {remote_path}")))?;
            state.gets.push(remote_path.to_string());
            if let Some((n, token)) = &state.cancel_after {
                if state.gets.len() >= *n {
                    token.cancel();
                }
            }
            size
        };
        std::fs::write(local_path, vec![0u8; size as usize])?;
        Ok(size)
    }

    async fn delete(&mut self, remote_path: &str) -> Result<()> {
        let mut state = lock(&self.server.state);
        if state.fail_delete {
            return Err(Error::Ftp(format!("mock DELE failure for {remote_path}")));
        }
        state.deletes.push(remote_path.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording modem
// ---------------------------------------------------------------------------

/// Modem double that records dial/hang-up brackets and tracks concurrency.
pub(crate) struct MockModem {
    fail_dial: bool,
    dial_delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl MockModem {
    pub(crate) fn new() -> Self {
        Self {
            fail_dial: false,
            dial_delay: Duration::from_millis(20),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_dial: true,
            ..Self::new()
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub(crate) fn peak_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DialUpModem for MockModem {
    async fn dial(
        &self,
        entry_name: &str,
        _number: &str,
        _username: &str,
        _password: &str,
        _timeout: Duration,
    ) -> Result<()> {
        if self.fail_dial {
            lock(&self.events).push(format!("dial-failed:{entry_name}"));
            return Err(Error::DialUp("mock modem is out of order".to_string()));
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.dial_delay).await;
        lock(&self.events).push(format!("dial:{entry_name}"));
        Ok(())
    }

    async fn hang_up(&self, entry_name: &str) -> Result<()> {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        lock(&self.events).push(format!("hangup:{entry_name}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory status store
// ---------------------------------------------------------------------------

/// Status store that keeps every write in memory (or fails every write).
#[derive(Default)]
pub(crate) struct MemoryStatusStore {
    fail: bool,
    successes: Mutex<Vec<(i64, String)>>,
    failures: Mutex<Vec<(i64, String)>>,
    files: Mutex<Vec<NewDownloadedFile>>,
}

impl MemoryStatusStore {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn successes(&self) -> Vec<(i64, String)> {
        lock(&self.successes).clone()
    }

    pub(crate) fn failures(&self) -> Vec<(i64, String)> {
        lock(&self.failures).clone()
    }

    pub(crate) fn downloaded_files(&self) -> Vec<NewDownloadedFile> {
        lock(&self.files).clone()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert_success(&self, device_id: i64, file: &str, _when: DateTime<Utc>) -> Result<()> {
        if self.fail {
            return Err(Error::Other("store unavailable".to_string()));
        }
        lock(&self.successes).push((device_id, file.to_string()));
        Ok(())
    }

    async fn upsert_failure(
        &self,
        device_id: i64,
        message: &str,
        _when: DateTime<Utc>,
    ) -> Result<()> {
        if self.fail {
            return Err(Error::Other("store unavailable".to_string()));
        }
        lock(&self.failures).push((device_id, message.to_string()));
        Ok(())
    }

    async fn append_downloaded_file(&self, row: &NewDownloadedFile) -> Result<()> {
        if self.fail {
            return Err(Error::Other("store unavailable".to_string()));
        }
        lock(&self.files).push(row.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collecting notifier
// ---------------------------------------------------------------------------

/// Notifier double that records every dispatched notification.
#[derive(Default)]
pub(crate) struct CollectingNotifier {
    sent: Mutex<Vec<(String, PathBuf)>>,
}

impl CollectingNotifier {
    pub(crate) fn notifications(&self) -> Vec<(String, PathBuf)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl FileUpdateNotifier for CollectingNotifier {
    async fn file_updated(
        &self,
        device: &str,
        file_path: &Path,
        _recipients: &[String],
    ) -> Result<()> {
        lock(&self.sent).push((device.to_string(), file_path.to_path_buf()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A runner context over mock collaborators plus the execution resources
/// needed to build runners.
pub(crate) struct TestHarness {
    pub temp: tempfile::TempDir,
    pub ftp: MockFtpServer,
    pub modem: Arc<MockModem>,
    pub store: Arc<MemoryStatusStore>,
    pub notifier: Arc<CollectingNotifier>,
    pub ctx: Arc<RunnerContext>,
    pub pool: WorkerPool,
    pub registry: ResourceWorkerRegistry,
    pub cancel: CancellationToken,
}

impl TestHarness {
    pub(crate) fn new() -> Self {
        Self::build(Arc::new(MockModem::new()), |_| {})
    }

    pub(crate) fn with_modem(modem: Arc<MockModem>) -> Self {
        Self::build(modem, |_| {})
    }

    pub(crate) fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(Arc::new(MockModem::new()), adjust)
    }

    fn build(modem: Arc<MockModem>, adjust: impl FnOnce(&mut Config)) -> Self {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let mut config = Config {
            default_local_path: temp.path().to_path_buf(),
            ..Config::default()
        };
        adjust(&mut config);
        let config = Arc::new(config);
        let ftp = MockFtpServer::new();
        let store = Arc::new(MemoryStatusStore::default());
        let notifier = Arc::new(CollectingNotifier::default());
        let bus = ProgressBus::new(config.progress_queue_depth);
        let recorder = Arc::new(StatusRecorder::new(store.clone(), &config));
        let ctx = Arc::new(RunnerContext {
            config,
            bus,
            recorder,
            ftp: Arc::new(ftp.clone()),
            modem: modem.clone(),
            share_auth: Arc::new(NoOpShareAuthenticator),
            notifier: notifier.clone(),
        });
        Self {
            temp,
            ftp,
            modem,
            store,
            notifier,
            ctx,
            pool: WorkerPool::new(4),
            registry: ResourceWorkerRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn runner(&self, device: Device, profile: ConnectionProfile) -> Arc<DeviceRunner> {
        DeviceRunner::new(
            device,
            profile,
            self.ctx.clone(),
            &self.pool,
            &self.registry,
            &self.cancel,
        )
        .expect("runner construction")
    }
}

/// A plain FTP device (no dial-up).
pub(crate) fn test_device(acronym: &str) -> Device {
    Device {
        id: 7,
        acronym: acronym.to_string(),
        name: format!("{acronym} recorder"),
        enabled: true,
        original_source: None,
        connection_string: "host=127.0.0.1; port=21; userName=u; password=p".to_string(),
    }
}

/// A dial-up device bound to `entry`.
pub(crate) fn dial_up_device(acronym: &str, id: i64, entry: &str) -> Device {
    Device {
        id,
        acronym: acronym.to_string(),
        name: format!("{acronym} recorder"),
        enabled: true,
        original_source: None,
        connection_string: format!(
            "host=127.0.0.1; useDialUp=true; dialUpEntryName={entry}; dialUpNumber=555"
        ),
    }
}

/// A single-task profile with the given settings string.
pub(crate) fn single_task_profile(settings: &str) -> ConnectionProfile {
    ConnectionProfile {
        id: 1,
        name: "Default".to_string(),
        tasks: vec![ConnectionProfileTask {
            id: 11,
            name: "fetch".to_string(),
            settings: settings.to_string(),
        }],
    }
}

/// Drain broadcast progress until a `Finished` event (or timeout), returning
/// every update seen.
pub(crate) async fn collect_until_finished(
    rx: &mut tokio::sync::broadcast::Receiver<DeviceProgress>,
) -> Vec<crate::progress::ProgressUpdate> {
    let mut updates = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(payload)) => {
                let finished = payload
                    .updates
                    .iter()
                    .any(|u| u.state == ProgressState::Finished);
                updates.extend(payload.updates);
                if finished {
                    break;
                }
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    updates
}
