//! Network-share authentication interface
//!
//! Tasks whose local path points at a network share can carry `domain\user`
//! credentials. Establishing those credentials is platform plumbing, so it
//! lives behind a trait; the engine authenticates each distinct path once per
//! run and treats failure as a warning (the task may still fail later on
//! write, which is reported in its own right).

use std::path::Path;

use crate::error::Result;

/// Establishes credentials for a share path.
pub trait ShareAuthenticator: Send + Sync {
    /// Authenticate `path` with `username` (`domain\user` form) and `password`.
    fn authenticate(&self, path: &Path, username: &str, password: &str) -> Result<()>;
}

/// Default authenticator: accepts everything without doing anything, which is
/// correct on hosts where share access is ambient (or shares are unused).
pub struct NoOpShareAuthenticator;

impl ShareAuthenticator for NoOpShareAuthenticator {
    fn authenticate(&self, _path: &Path, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }
}
