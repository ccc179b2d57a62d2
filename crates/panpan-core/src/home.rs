//! Canonical home directory resolution for panpan.
//!
//! Every per-user artifact (socket, PID file, daemon log, config) lives under
//! `<home>/.panpan/`.
//!
//! # Precedence
//!
//! 1. `PANPAN_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default
//!
//! Integration tests MUST point `PANPAN_HOME` (or an explicit home path) at a
//! temporary directory so they never touch a real daemon.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "PANPAN_HOME";

/// Name of the per-user state directory below the home directory.
pub const STATE_DIR: &str = ".panpan";

/// Get the home directory for panpan operations.
///
/// # Errors
///
/// Returns an error if `PANPAN_HOME` is not set and the platform home
/// directory cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().context("Could not determine home directory")
}

/// `<home>/.panpan`
pub fn state_dir(home: &Path) -> PathBuf {
    home.join(STATE_DIR)
}

/// Default Unix socket path: `<home>/.panpan/daemon.sock`.
pub fn socket_path(home: &Path) -> PathBuf {
    state_dir(home).join("daemon.sock")
}

/// PID file written by the daemon: `<home>/.panpan/daemon.pid`.
pub fn pid_path(home: &Path) -> PathBuf {
    state_dir(home).join("daemon.pid")
}

/// Daemon stderr log used by the lifecycle manager: `<home>/.panpan/daemon.log`.
pub fn log_path(home: &Path) -> PathBuf {
    state_dir(home).join("daemon.log")
}

/// Config file: `<home>/.panpan/config.toml`.
pub fn config_path(home: &Path) -> PathBuf {
    state_dir(home).join("config.toml")
}
