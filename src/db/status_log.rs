//! Status-log row operations — one most-recent-outcome row per device

use super::{Database, StatusLogRow};
use crate::error::Result;

impl Database {
    /// Record a success: last file, success timestamp, and download timestamp.
    pub(super) async fn record_success_row(
        &self,
        device_id: i64,
        file: &str,
        when: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO status_log (device_id, last_file, last_success, file_download_timestamp)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT (device_id) DO UPDATE SET
                last_file = excluded.last_file,
                last_success = excluded.last_success,
                file_download_timestamp = excluded.file_download_timestamp
            "#,
        )
        .bind(device_id)
        .bind(file)
        .bind(when)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a failure: message and failure timestamp.
    pub(super) async fn record_failure_row(
        &self,
        device_id: i64,
        message: &str,
        when: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO status_log (device_id, message, last_failure)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (device_id) DO UPDATE SET
                message = excluded.message,
                last_failure = excluded.last_failure
            "#,
        )
        .bind(device_id)
        .bind(message)
        .bind(when)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch a device's status row, if any.
    pub async fn status_log(&self, device_id: i64) -> Result<Option<StatusLogRow>> {
        let row = sqlx::query_as::<_, StatusLogRow>(
            "SELECT device_id, last_file, last_success, last_failure, message, \
             file_download_timestamp FROM status_log WHERE device_id = ?1",
        )
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }
}
