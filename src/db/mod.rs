//! Database layer for fleet-dl
//!
//! Sqlite persistence for the status-log and downloaded-file tables. This is
//! the shipped implementation of [`StatusStore`](crate::status::StatusStore);
//! deployments with their own relational layer substitute their own store.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — database lifecycle, schema creation
//! - [`status_log`] — one most-recent-outcome row per device
//! - [`downloaded_files`] — append-only download history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;

use crate::error::Result;
use crate::status::{NewDownloadedFile, StatusStore};

mod downloaded_files;
mod migrations;
mod status_log;

/// Most-recent-outcome row for one device.
#[derive(Debug, Clone, FromRow)]
pub struct StatusLogRow {
    /// Device the row belongs to (one row per device)
    pub device_id: i64,
    /// Local path of the last file recorded
    pub last_file: Option<String>,
    /// Unix timestamp of the last success
    pub last_success: Option<i64>,
    /// Unix timestamp of the last failure
    pub last_failure: Option<i64>,
    /// Message from the last failure
    pub message: Option<String>,
    /// Unix timestamp of the last recorded download
    pub file_download_timestamp: Option<i64>,
}

/// Downloaded-file history record.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadedFileRow {
    /// Unique database ID
    pub id: i64,
    /// Device the file was retrieved for
    pub device_id: i64,
    /// Unix timestamp the local copy was created
    pub creation_time_utc: i64,
    /// Full local path of the file
    pub file: String,
    /// Recorded size in "KB"
    pub file_size_kb: i64,
    /// Unix timestamp the download finished
    pub timestamp: i64,
}

/// Sqlite-backed status store.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StatusStore for Database {
    async fn upsert_success(&self, device_id: i64, file: &str, when: DateTime<Utc>) -> Result<()> {
        self.record_success_row(device_id, file, when.timestamp())
            .await
    }

    async fn upsert_failure(
        &self,
        device_id: i64,
        message: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        self.record_failure_row(device_id, message, when.timestamp())
            .await
    }

    async fn append_downloaded_file(&self, row: &NewDownloadedFile) -> Result<()> {
        self.insert_downloaded_file(row).await
    }
}
