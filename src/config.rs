//! Configuration types for fleet-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global configuration for [`FleetDownloader`](crate::FleetDownloader)
///
/// Per-device behavior lives in [`TaskSettings`](crate::types::TaskSettings);
/// this struct holds the process-wide knobs shared by every device runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of pooled transfer workers (default: 20)
    ///
    /// Devices that do not use dial-up are distributed across this many
    /// cooperative workers. `0` disables pooling entirely: each such device
    /// gets a private long-running worker instead.
    #[serde(default = "default_ftp_thread_count")]
    pub ftp_thread_count: usize,

    /// Download volume threshold in MB (base-1000) per window (default: 0 = disabled)
    ///
    /// Once a device has downloaded more than this many megabytes inside the
    /// current window, remaining transfers in the run are skipped with a
    /// failure warning until the window rolls over.
    #[serde(default)]
    pub max_download_threshold: u64,

    /// Length of the download-threshold window in hours (default: 24)
    #[serde(default = "default_threshold_window_hours")]
    pub max_download_threshold_time_window: u64,

    /// File extensions eligible for status-log success updates (default: ".rcd,.d00,.dat,.ctl,.cfg,.pcd")
    #[serde(default = "default_status_log_inclusions")]
    pub status_log_inclusions: String,

    /// File-name prefixes excluded from status-log success updates (default: "rms.,trend.")
    #[serde(default = "default_status_log_exclusions")]
    pub status_log_exclusions: String,

    /// Maximum remote file age in whole days for the age filter (default: 30)
    #[serde(default = "default_max_remote_file_age")]
    pub max_remote_file_age: i64,

    /// Maximum local file age in whole days for the local purge pass (default: 365)
    #[serde(default = "default_max_local_file_age")]
    pub max_local_file_age: i64,

    /// Root directory for devices whose tasks specify no local path (default: "./downloads")
    #[serde(default = "default_local_path")]
    pub default_local_path: PathBuf,

    /// Path to the sqlite status store (default: "./fleet-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Capacity of the progress dispatch queue (default: 256)
    ///
    /// Progress publishing is lossy best-effort: when the dispatcher falls
    /// this far behind, further updates are dropped rather than stalling a
    /// transfer.
    #[serde(default = "default_progress_queue_depth")]
    pub progress_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ftp_thread_count: default_ftp_thread_count(),
            max_download_threshold: 0,
            max_download_threshold_time_window: default_threshold_window_hours(),
            status_log_inclusions: default_status_log_inclusions(),
            status_log_exclusions: default_status_log_exclusions(),
            max_remote_file_age: default_max_remote_file_age(),
            max_local_file_age: default_max_local_file_age(),
            default_local_path: default_local_path(),
            database_path: default_database_path(),
            progress_queue_depth: default_progress_queue_depth(),
        }
    }
}

impl Config {
    /// Status-log inclusion extensions, lowercased and trimmed.
    pub fn status_log_inclusion_list(&self) -> Vec<String> {
        split_list(&self.status_log_inclusions)
    }

    /// Status-log exclusion prefixes, lowercased and trimmed.
    pub fn status_log_exclusion_list(&self) -> Vec<String> {
        split_list(&self.status_log_exclusions)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_ftp_thread_count() -> usize {
    20
}

fn default_threshold_window_hours() -> u64 {
    24
}

fn default_status_log_inclusions() -> String {
    ".rcd,.d00,.dat,.ctl,.cfg,.pcd".to_string()
}

fn default_status_log_exclusions() -> String {
    "rms.,trend.".to_string()
}

fn default_max_remote_file_age() -> i64 {
    30
}

fn default_max_local_file_age() -> i64 {
    365
}

fn default_local_path() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./fleet-dl.db")
}

fn default_progress_queue_depth() -> usize {
    256
}
