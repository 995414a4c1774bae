//! Downloaded-file history operations

use super::{Database, DownloadedFileRow};
use crate::error::Result;
use crate::status::NewDownloadedFile;

impl Database {
    /// Append one downloaded-file record.
    pub(super) async fn insert_downloaded_file(&self, row: &NewDownloadedFile) -> Result<()> {
        sqlx::query(
            "INSERT INTO downloaded_file \
             (device_id, creation_time_utc, file, file_size_kb, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(row.device_id)
        .bind(row.creation_time_utc.timestamp())
        .bind(&row.file)
        .bind(row.file_size_kb)
        .bind(row.timestamp.timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch a device's download history, oldest first.
    pub async fn downloaded_files(&self, device_id: i64) -> Result<Vec<DownloadedFileRow>> {
        let rows = sqlx::query_as::<_, DownloadedFileRow>(
            "SELECT id, device_id, creation_time_utc, file, file_size_kb, timestamp \
             FROM downloaded_file WHERE device_id = ?1 ORDER BY id",
        )
        .bind(device_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
