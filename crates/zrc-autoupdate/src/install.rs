//! Installer hand-off.
//!
//! Once an installer has passed verification it is handed to an
//! [`InstallLauncher`]. The engine never starts a process on its own.

use std::path::Path;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use tracing::info;

use crate::error::UpdateError;

/// Starts a verified installer.
#[async_trait]
pub trait InstallLauncher: Send + Sync {
    /// Launch `installer` with `args` (the appcast's installer arguments).
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Launch`] if the installer cannot be started.
    async fn launch(&self, installer: &Path, args: &str) -> Result<(), UpdateError>;
}

/// Launches the installer as a detached child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl InstallLauncher for ProcessLauncher {
    async fn launch(&self, installer: &Path, args: &str) -> Result<(), UpdateError> {
        let child = Command::new(installer)
            .args(args.split_whitespace())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| UpdateError::Launch(format!("{}: {}", installer.display(), e)))?;

        info!(installer = %installer.display(), pid = child.id(), "Installer started");
        Ok(())
    }
}
