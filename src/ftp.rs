//! FTP transport interface and the suppaftp-backed production implementation
//!
//! The engine talks to devices through the [`FtpSession`] trait so the
//! protocol client stays replaceable (and mockable in tests). The shipped
//! implementation drives [`suppaftp::AsyncFtpStream`]: connect with timeout,
//! login, binary mode, `LIST` parsing via [`suppaftp::list::File`], and
//! streamed `RETR` with cancellation checks between reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::AsyncReadExt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use suppaftp::AsyncFtpStream;
use suppaftp::types::FileType;

use crate::error::{Error, Result};
use crate::types::{DeviceSettings, RemoteEntry, RemoteFile};

/// Read-buffer size for streamed retrievals.
const RETR_BUFFER: usize = 64 * 1024;

/// An open session to one device.
#[async_trait]
pub trait FtpSession: Send {
    /// Change the remote working directory.
    async fn set_working_dir(&mut self, dir: &str) -> Result<()>;

    /// List `dir` (relative to the working directory; empty = the working
    /// directory itself), returning files and sub-directories.
    async fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Download `remote_path` into `local_path`, returning the bytes written.
    ///
    /// Implementations check `cancel` between reads and abort with an error
    /// when it fires.
    async fn retrieve(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Delete a remote file.
    async fn delete(&mut self, remote_path: &str) -> Result<()>;

    /// Close the session politely. Errors are reported but the session is
    /// gone either way.
    async fn close(&mut self) -> Result<()>;
}

/// Opens [`FtpSession`]s for devices.
#[async_trait]
pub trait FtpConnector: Send + Sync {
    /// Open a session using the device's parsed connection settings.
    async fn connect(&self, settings: &DeviceSettings) -> Result<Box<dyn FtpSession>>;
}

/// Production connector over [`suppaftp`].
pub struct SuppaFtpConnector;

#[async_trait]
impl FtpConnector for SuppaFtpConnector {
    async fn connect(&self, settings: &DeviceSettings) -> Result<Box<dyn FtpSession>> {
        let addr = format!("{}:{}", settings.host, settings.port);

        let mut stream = tokio::time::timeout(
            settings.connection_timeout,
            AsyncFtpStream::connect(addr.clone()),
        )
        .await
        .map_err(|_| Error::Ftp(format!("connection to {addr} timed out")))?
        .map_err(|e| Error::Ftp(format!("connect to {addr} failed: {e}")))?;

        let username = if settings.username.is_empty() {
            "anonymous"
        } else {
            settings.username.as_str()
        };
        stream
            .login(username, settings.password.as_str())
            .await
            .map_err(|e| Error::Ftp(format!("login failed: {e}")))?;
        stream
            .transfer_type(FileType::Binary)
            .await
            .map_err(|e| Error::Ftp(format!("binary mode failed: {e}")))?;

        Ok(Box::new(SuppaFtpSession { stream }))
    }
}

struct SuppaFtpSession {
    stream: AsyncFtpStream,
}

#[async_trait]
impl FtpSession for SuppaFtpSession {
    async fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        self.stream
            .cwd(dir)
            .await
            .map_err(|e| Error::Ftp(format!("CWD {dir} failed: {e}")))
    }

    async fn list(&mut self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let path = if dir.is_empty() { None } else { Some(dir) };
        let lines = self
            .stream
            .list(path)
            .await
            .map_err(|e| Error::Ftp(format!("LIST {dir:?} failed: {e}")))?;

        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            match suppaftp::list::File::from_str(line) {
                Ok(file) if file.is_directory() => {
                    entries.push(RemoteEntry::Directory(file.name().to_string()));
                }
                Ok(file) if file.is_file() => {
                    let modified: DateTime<Utc> = file.modified().into();
                    entries.push(RemoteEntry::File(RemoteFile {
                        name: file.name().to_string(),
                        size: file.size() as u64,
                        modified,
                    }));
                }
                Ok(_) => {} // symlinks and other special entries are skipped
                Err(e) => {
                    tracing::debug!(line = %line, error = %e, "unparseable LIST line skipped");
                }
            }
        }
        Ok(entries)
    }

    async fn retrieve(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut reader = self
            .stream
            .retr_as_stream(remote_path)
            .await
            .map_err(|e| Error::Ftp(format!("RETR {remote_path} failed: {e}")))?;

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut buf = vec![0u8; RETR_BUFFER];
        let mut written: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                drop(reader);
                return Err(Error::Ftp(format!("RETR {remote_path} cancelled")));
            }
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| Error::Ftp(format!("read during RETR {remote_path}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;

        self.stream
            .finalize_retr_stream(reader)
            .await
            .map_err(|e| Error::Ftp(format!("finalize RETR {remote_path}: {e}")))?;

        Ok(written)
    }

    async fn delete(&mut self, remote_path: &str) -> Result<()> {
        self.stream
            .rm(remote_path)
            .await
            .map_err(|e| Error::Ftp(format!("DELE {remote_path} failed: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .quit()
            .await
            .map_err(|e| Error::Ftp(format!("QUIT failed: {e}")))
    }
}
