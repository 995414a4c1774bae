//! File-update notification interface
//!
//! Tasks can request a notification for every downloaded file. Delivery (in
//! practice SMTP) is an external collaborator; the engine dispatches each
//! notification fire-and-forget on its own task, and a delivery failure is a
//! warning that never affects the run.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

/// Delivers per-file update notifications.
#[async_trait]
pub trait FileUpdateNotifier: Send + Sync {
    /// Notify `recipients` that `file_path` was just retrieved for `device`.
    async fn file_updated(&self, device: &str, file_path: &Path, recipients: &[String])
    -> Result<()>;
}

/// Default notifier that silently accepts everything.
pub struct NoOpNotifier;

#[async_trait]
impl FileUpdateNotifier for NoOpNotifier {
    async fn file_updated(
        &self,
        _device: &str,
        _file_path: &Path,
        _recipients: &[String],
    ) -> Result<()> {
        Ok(())
    }
}
