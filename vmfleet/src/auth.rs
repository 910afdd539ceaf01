//! Privilege elevation for engine launches.
//!
//! Bridged networking needs root. Elevation is validated once before any
//! instance work and the resulting context is passed to every launch, so no
//! pipeline ever prompts for a password.

use std::ffi::OsStr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use vmfleet_shared::errors::PreconditionError;

use crate::util::find_in_path;

/// How the caller wants engines started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Run directly as root, or through `sudo` otherwise
    #[default]
    Auto,
    /// Never elevate (`--no-sudo`)
    Unprivileged,
}

/// Elevation acquired for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Already running with euid 0
    Root,
    /// Credentials cached by `sudo -v`; launches use `sudo -n`
    Sudo { binary: PathBuf },
    Unprivileged,
}

impl AuthContext {
    /// Acquire elevation for `mode`.
    ///
    /// In `Auto` mode as a regular user this runs `sudo -v` once, which may
    /// prompt on the controlling terminal.
    pub async fn acquire(mode: AuthMode) -> Result<Self, PreconditionError> {
        if mode == AuthMode::Unprivileged {
            tracing::info!("Running without privilege elevation");
            return Ok(AuthContext::Unprivileged);
        }
        if nix::unistd::geteuid().is_root() {
            tracing::debug!("Running as root, no elevation needed");
            return Ok(AuthContext::Root);
        }

        let binary = find_in_path("sudo").ok_or_else(|| {
            PreconditionError::Authorization(
                "not running as root and 'sudo' is not installed (use --no-sudo to skip elevation)"
                    .to_string(),
            )
        })?;

        tracing::info!("Validating sudo credentials");
        let status = Command::new(&binary)
            .arg("-v")
            .status()
            .await
            .map_err(|e| PreconditionError::Authorization(format!("failed to run sudo: {e}")))?;
        if !status.success() {
            return Err(PreconditionError::Authorization(format!(
                "sudo -v exited with {status}"
            )));
        }

        Ok(AuthContext::Sudo { binary })
    }

    /// The context `acquire` would produce, without validating anything.
    ///
    /// Used for dry runs, which must not prompt.
    pub fn preview(mode: AuthMode) -> Self {
        match mode {
            AuthMode::Unprivileged => AuthContext::Unprivileged,
            AuthMode::Auto if nix::unistd::geteuid().is_root() => AuthContext::Root,
            AuthMode::Auto => AuthContext::Sudo {
                binary: find_in_path("sudo").unwrap_or_else(|| PathBuf::from("sudo")),
            },
        }
    }

    pub fn is_elevated(&self) -> bool {
        !matches!(self, AuthContext::Unprivileged)
    }

    /// Arguments placed before the program on the command line.
    pub fn prefix(&self) -> Vec<String> {
        match self {
            AuthContext::Sudo { binary } => {
                vec![binary.to_string_lossy().into_owned(), "-n".to_string()]
            }
            AuthContext::Root | AuthContext::Unprivileged => Vec::new(),
        }
    }

    /// Build a command running `program` under this context.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        match self {
            AuthContext::Sudo { binary } => {
                let mut cmd = Command::new(binary);
                cmd.arg("-n").arg(program);
                cmd
            }
            AuthContext::Root | AuthContext::Unprivileged => Command::new(program),
        }
    }
}
