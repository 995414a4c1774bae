//! # fleet-dl
//!
//! Scheduled file-retrieval engine for fleets of industrial devices
//! (power-quality meters, fault recorders, and similar equipment that
//! publishes records over FTP).
//!
//! ## Design Philosophy
//!
//! fleet-dl is designed to be:
//! - **Fleet-oriented** - many devices share a small pool of transfer workers
//! - **Resource-aware** - devices behind one modem run strictly serially
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - consumers subscribe to progress, no polling required
//!
//! Each registered device carries a connection profile: what to fetch, where
//! to put it, and a cron schedule saying when. The engine opens a session at
//! the scheduled minute, enumerates matching remote files, transfers them
//! with filtering and de-duplication rules, optionally archives local copies
//! or deletes remote ones, and records outcomes to the status store. Live
//! progress is broadcast to subscribers throughout.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleet_dl::{Config, FleetDownloader};
//! use fleet_dl::types::{ConnectionProfile, ConnectionProfileTask, Device};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = FleetDownloader::new(Config::default()).await?;
//!
//!     // Subscribe to progress
//!     let mut progress = engine.subscribe_progress();
//!     tokio::spawn(async move {
//!         while let Ok(update) = progress.recv().await {
//!             println!("{}: {:?}", update.device, update.updates);
//!         }
//!     });
//!
//!     engine.register_device(
//!         Device {
//!             id: 1,
//!             acronym: "SHELBY".into(),
//!             name: "Shelby substation recorder".into(),
//!             enabled: true,
//!             original_source: None,
//!             connection_string: "host=10.1.2.3; schedule=*/15 * * * *".into(),
//!         },
//!         ConnectionProfile {
//!             id: 1,
//!             name: "Default".into(),
//!             tasks: vec![ConnectionProfileTask {
//!                 id: 1,
//!                 name: "records".into(),
//!                 settings: "fileExtensions=*.rcd,*.dat; remotePath=/records".into(),
//!             }],
//!         },
//!     )?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Global configuration
pub mod config;
/// Sqlite status store
pub mod db;
/// The engine itself
pub mod engine;
/// Error types
pub mod error;
/// Cooperative workers, pool, registry, and run-once coalescing
pub mod exec;
/// FTP transport interface and suppaftp implementation
pub mod ftp;
/// Dial-up modem interface
pub mod modem;
/// File-update notification interface
pub mod notifier;
/// Progress events and the lossy fan-out bus
pub mod progress;
/// Per-device runner
pub mod runner;
/// Cron schedules and the minute clock
pub mod schedule;
/// Network-share authentication interface
pub mod share_auth;
/// Runtime counters and exported statistics
pub mod stats;
/// Status recording over the persistence collaborator
pub mod status;
/// Path-template expansion
pub mod templating;
/// Core types: devices, profiles, task settings
pub mod types;
/// File-spec matching and local file management helpers
pub mod utils;

mod transfer;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use engine::{Collaborators, FleetDownloader};
pub use error::{Error, Result};
pub use ftp::{FtpConnector, FtpSession, SuppaFtpConnector};
pub use modem::{DialUpModem, NoModem};
pub use notifier::{FileUpdateNotifier, NoOpNotifier};
pub use progress::{DeviceProgress, ProgressBus, ProgressState, ProgressUpdate};
pub use runner::DeviceRunner;
pub use schedule::{CronSchedule, ScheduleClock, ScheduleDue};
pub use share_auth::{NoOpShareAuthenticator, ShareAuthenticator};
pub use stats::{RuntimeStats, StatisticsSnapshot};
pub use status::{NewDownloadedFile, StatusRecorder, StatusStore};
pub use types::{
    ConnectionProfile, ConnectionProfileTask, Device, DeviceSettings, RemoteEntry, RemoteFile,
    TaskSettings,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use fleet_dl::{Config, FleetDownloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = FleetDownloader::new(Config::default()).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(engine).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: FleetDownloader) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers,
    // tests); fall back progressively.
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
