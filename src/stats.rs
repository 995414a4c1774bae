//! Per-device runtime state and exported statistics

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-lifetime counters for one device.
///
/// All counters are monotonically non-decreasing except `files_downloaded`,
/// which resets at the start of every run. Reads are relaxed: observers may
/// lag by a run.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    attempted_connections: AtomicU64,
    successful_connections: AtomicU64,
    failed_connections: AtomicU64,
    attempted_dial_ups: AtomicU64,
    successful_dial_ups: AtomicU64,
    failed_dial_ups: AtomicU64,
    total_processed_files: AtomicU64,
    files_downloaded: AtomicU64,
    total_files_downloaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    total_connected_secs: AtomicU64,
    total_dial_up_secs: AtomicU64,
    overall_tasks_count: AtomicU64,
    overall_tasks_completed: AtomicU64,
    threshold_window: Mutex<ThresholdWindow>,
}

#[derive(Debug)]
struct ThresholdWindow {
    started: Instant,
    bytes: u64,
}

impl Default for ThresholdWindow {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            bytes: 0,
        }
    }
}

impl RuntimeStats {
    /// Fresh, all-zero state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a run: `files_downloaded` resets, everything else keeps.
    pub fn begin_run(&self) {
        self.files_downloaded.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_attempt(&self) {
        self.attempted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_success(&self) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_failure(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_up_attempt(&self) {
        self.attempted_dial_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_up_success(&self) {
        self.successful_dial_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_up_failure(&self) {
        self.failed_dial_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed_file(&self) {
        self.total_processed_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_downloaded_file(&self, bytes: u64) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.total_files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count `n` files that appeared without byte accounting (external operations).
    pub(crate) fn record_collected_files(&self, n: u64) {
        self.files_downloaded.fetch_add(n, Ordering::Relaxed);
        self.total_files_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_connected_time(&self, elapsed: Duration) {
        self.total_connected_secs
            .fetch_add(elapsed.as_secs(), Ordering::Relaxed);
    }

    pub(crate) fn record_dial_up_time(&self, elapsed: Duration) {
        self.total_dial_up_secs
            .fetch_add(elapsed.as_secs(), Ordering::Relaxed);
    }

    pub(crate) fn set_overall_tasks(&self, count: u64) {
        self.overall_tasks_count.store(count, Ordering::Relaxed);
        self.overall_tasks_completed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_task_completed(&self) {
        self.overall_tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Files downloaded by the current (or most recent) run.
    pub fn files_downloaded(&self) -> u64 {
        self.files_downloaded.load(Ordering::Relaxed)
    }

    /// Total bytes downloaded over the process lifetime.
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Overall task progress anchors `(completed, count)`.
    pub fn task_progress(&self) -> (u64, u64) {
        (
            self.overall_tasks_completed.load(Ordering::Relaxed),
            self.overall_tasks_count.load(Ordering::Relaxed),
        )
    }

    /// Add downloaded bytes to the rolling threshold window, rolling it over
    /// when `window` has elapsed. Returns the window's current byte count.
    pub(crate) fn add_window_bytes(&self, bytes: u64, window: Duration) -> u64 {
        let mut state = match self.threshold_window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.started.elapsed() > window {
            state.started = Instant::now();
            state.bytes = 0;
        }
        state.bytes += bytes;
        state.bytes
    }

    /// Export the device's statistics.
    pub fn snapshot(&self, enabled: bool) -> StatisticsSnapshot {
        StatisticsSnapshot {
            attempted_connections: self.attempted_connections.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            attempted_dial_ups: self.attempted_dial_ups.load(Ordering::Relaxed),
            successful_dial_ups: self.successful_dial_ups.load(Ordering::Relaxed),
            failed_dial_ups: self.failed_dial_ups.load(Ordering::Relaxed),
            files_downloaded: self.total_files_downloaded.load(Ordering::Relaxed),
            megabytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed) as f64 / 1e6,
            total_connected_time: self.total_connected_secs.load(Ordering::Relaxed),
            total_dial_up_time: self.total_dial_up_secs.load(Ordering::Relaxed),
            enabled,
        }
    }
}

/// Point-in-time statistics for one device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// FTP sessions attempted
    pub attempted_connections: u64,
    /// FTP sessions opened
    pub successful_connections: u64,
    /// FTP sessions that failed to open
    pub failed_connections: u64,
    /// Dial attempts
    pub attempted_dial_ups: u64,
    /// Successful dials
    pub successful_dial_ups: u64,
    /// Failed dials
    pub failed_dial_ups: u64,
    /// Files downloaded over the process lifetime
    pub files_downloaded: u64,
    /// Megabytes (base-1000) downloaded over the process lifetime
    pub megabytes_downloaded: f64,
    /// Seconds spent with an open session
    pub total_connected_time: u64,
    /// Seconds spent on dial-up links
    pub total_dial_up_time: u64,
    /// Whether the device is enabled
    pub enabled: bool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_downloaded_resets_per_run_but_totals_keep() {
        let stats = RuntimeStats::new();
        stats.begin_run();
        stats.record_downloaded_file(100);
        stats.record_downloaded_file(50);
        assert_eq!(stats.files_downloaded(), 2);

        stats.begin_run();
        assert_eq!(stats.files_downloaded(), 0);
        let snapshot = stats.snapshot(true);
        assert_eq!(snapshot.files_downloaded, 2);
        assert!((snapshot.megabytes_downloaded - 150.0 / 1e6).abs() < 1e-12);
    }

    #[test]
    fn success_plus_failure_never_exceeds_attempts() {
        let stats = RuntimeStats::new();
        for i in 0..10 {
            stats.record_connection_attempt();
            if i % 2 == 0 {
                stats.record_connection_success();
            } else if i % 3 == 0 {
                stats.record_connection_failure();
            }
        }
        let snapshot = stats.snapshot(true);
        assert!(
            snapshot.successful_connections + snapshot.failed_connections
                <= snapshot.attempted_connections
        );
    }

    #[test]
    fn threshold_window_accumulates_until_rollover() {
        let stats = RuntimeStats::new();
        let window = Duration::from_secs(3600);
        assert_eq!(stats.add_window_bytes(1_000_000, window), 1_000_000);
        assert_eq!(stats.add_window_bytes(500_000, window), 1_500_000);
        // A zero-length window forces a rollover on the next add.
        assert_eq!(stats.add_window_bytes(10, Duration::ZERO), 10);
    }

    #[test]
    fn task_anchors_reset_with_overall_count() {
        let stats = RuntimeStats::new();
        stats.set_overall_tasks(3);
        stats.record_task_completed();
        assert_eq!(stats.task_progress(), (1, 3));
        stats.set_overall_tasks(2);
        assert_eq!(stats.task_progress(), (0, 2));
    }
}
