//! Dial-up link interface
//!
//! Dial-up devices are reached through a modem driven by an external PPP
//! stack; the engine only needs dial and hang-up brackets around a run. The
//! trait keeps that driver pluggable, and devices sharing one phone-book
//! entry are serialized upstream by the resource worker registry.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};

/// Modem control for dial-up devices.
#[async_trait]
pub trait DialUpModem: Send + Sync {
    /// Dial the given phone-book entry. Must resolve (or fail) within
    /// `timeout`; a timeout aborts only this dial attempt.
    async fn dial(
        &self,
        entry_name: &str,
        number: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Drop the link for the given entry. Best-effort.
    async fn hang_up(&self, entry_name: &str) -> Result<()>;
}

/// Default modem for installations without dial-up hardware: every dial
/// fails, hang-up is a no-op.
pub struct NoModem;

#[async_trait]
impl DialUpModem for NoModem {
    async fn dial(
        &self,
        entry_name: &str,
        _number: &str,
        _username: &str,
        _password: &str,
        _timeout: Duration,
    ) -> Result<()> {
        Err(Error::DialUp(format!(
            "no modem available to dial entry {entry_name:?}"
        )))
    }

    async fn hang_up(&self, _entry_name: &str) -> Result<()> {
        Ok(())
    }
}
