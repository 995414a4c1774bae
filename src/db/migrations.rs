//! Schema creation

use super::Database;
use crate::error::Result;

impl Database {
    /// Create the schema if it does not exist yet.
    pub(super) async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS status_log (
                device_id               INTEGER PRIMARY KEY,
                last_file               TEXT,
                last_success            INTEGER,
                last_failure            INTEGER,
                message                 TEXT,
                file_download_timestamp INTEGER
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloaded_file (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id         INTEGER NOT NULL,
                creation_time_utc INTEGER NOT NULL,
                file              TEXT NOT NULL,
                file_size_kb      INTEGER NOT NULL,
                timestamp         INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_downloaded_file_device \
             ON downloaded_file (device_id, timestamp)",
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
