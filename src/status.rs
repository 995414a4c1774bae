//! Status recording
//!
//! Terminal per-file and per-session facts are written to the persistence
//! collaborator through [`StatusStore`]. The [`StatusRecorder`] enforces the
//! scoping rules (success rows only for included, non-excluded files; failure
//! rows unconditionally), serializes writes process-wide, and isolates the
//! transfer path from store failures — a write error is a warning, never an
//! abort.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::Result;

/// Divisor for the downloaded-file size column. Not 1024: kept as-is so new
/// rows stay comparable with values already in the table.
const KB_DIVISOR: u64 = 1028;

/// A downloaded-file record to append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDownloadedFile {
    /// Device the file was retrieved for
    pub device_id: i64,
    /// Creation time of the local copy
    pub creation_time_utc: DateTime<Utc>,
    /// Full local path of the file
    pub file: String,
    /// File size in "KB" (see [`KB_DIVISOR`])
    pub file_size_kb: i64,
    /// When the download finished
    pub timestamp: DateTime<Utc>,
}

/// Persistence interface for terminal outcomes.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Update the device's single status row after a successful download.
    async fn upsert_success(&self, device_id: i64, file: &str, when: DateTime<Utc>) -> Result<()>;

    /// Update the device's single status row after a failure.
    async fn upsert_failure(&self, device_id: i64, message: &str, when: DateTime<Utc>)
    -> Result<()>;

    /// Append one downloaded-file record.
    async fn append_downloaded_file(&self, row: &NewDownloadedFile) -> Result<()>;
}

/// Writes terminal outcomes, applying scope rules and write serialization.
pub struct StatusRecorder {
    store: Arc<dyn StatusStore>,
    inclusions: Vec<String>,
    exclusions: Vec<String>,
    write_lock: Mutex<()>,
}

impl StatusRecorder {
    /// Build a recorder over `store` with the configured scope lists.
    pub fn new(store: Arc<dyn StatusStore>, config: &Config) -> Self {
        Self {
            store,
            inclusions: config.status_log_inclusion_list(),
            exclusions: config.status_log_exclusion_list(),
            write_lock: Mutex::new(()),
        }
    }

    /// Whether a successful download of `file_name` updates the status row.
    ///
    /// The extension must be in the inclusion set and the name must not start
    /// with any excluded prefix.
    pub fn in_scope(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        let extension = match lower.rfind('.') {
            Some(index) => &lower[index..],
            None => return false,
        };
        self.inclusions.iter().any(|inc| inc.as_str() == extension)
            && !self.exclusions.iter().any(|exc| lower.starts_with(exc.as_str()))
    }

    /// Record a successful download. Only in-scope files touch the store; a
    /// store failure is logged and swallowed.
    pub async fn record_success(&self, device_id: i64, local_path: &Path, size: u64) {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !self.in_scope(&file_name) {
            return;
        }

        let now = Utc::now();
        let row = NewDownloadedFile {
            device_id,
            creation_time_utc: now,
            file: local_path.to_string_lossy().to_string(),
            file_size_kb: (size / KB_DIVISOR) as i64,
            timestamp: now,
        };

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.store.upsert_success(device_id, &row.file, now).await {
            tracing::warn!(device_id, error = %e, "status-log success write failed");
        }
        if let Err(e) = self.store.append_downloaded_file(&row).await {
            tracing::warn!(device_id, error = %e, "downloaded-file append failed");
        }
    }

    /// Record a failure. Unconditional; a store failure is logged and swallowed.
    pub async fn record_failure(&self, device_id: i64, message: &str) {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self
            .store
            .upsert_failure(device_id, message, Utc::now())
            .await
        {
            tracing::warn!(device_id, error = %e, "status-log failure write failed");
        }
    }
}
