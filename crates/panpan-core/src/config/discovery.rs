//! Configuration discovery and resolution

use super::types::Config;
use crate::transport::{PORT_ENV, SOCKET_ENV};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Explicitly requested config file does not exist
    #[error("Configuration not found: {0}")]
    NotFound(PathBuf),
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Path to config file override
    pub config_path: Option<PathBuf>,
    /// Override the daemon socket path
    pub socket_path: Option<PathBuf>,
    /// Override the daemon TCP port
    pub tcp_port: Option<u16>,
    /// Force plan mode on
    pub plan_mode: Option<bool>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables
/// 3. Config file (`--config` path, else `<home>/.panpan/config.toml`)
/// 4. Defaults
///
/// A malformed default config file is logged and skipped; a malformed or
/// missing file named explicitly through `--config` is an error.
pub fn resolve_config(overrides: &ConfigOverrides, home_dir: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    // 3. Config file
    match &overrides.config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.clone()));
            }
            config = load_config_file(path)?;
        }
        None => {
            let default_path = crate::home::config_path(home_dir);
            if default_path.exists() {
                match load_config_file(&default_path) {
                    Ok(file_config) => config = file_config,
                    Err(e) => warn!("Failed to parse config at {default_path:?}: {e}"),
                }
            }
        }
    }

    // 2. Apply environment variables
    apply_env_overrides(&mut config);

    // 1. Apply command-line overrides
    apply_cli_overrides(&mut config, overrides);

    Ok(config)
}

/// Load config from a TOML file
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut Config) {
    if let Ok(socket) = std::env::var(SOCKET_ENV) {
        let socket = socket.trim();
        if !socket.is_empty() {
            config.daemon.socket_path = Some(PathBuf::from(socket));
        }
    }

    if let Ok(port) = std::env::var(PORT_ENV) {
        match port.trim().parse::<u16>() {
            Ok(port) => config.daemon.tcp_port = Some(port),
            Err(_) => warn!("Ignoring invalid {PORT_ENV}={port:?}"),
        }
    }
}

/// Apply command-line overrides
fn apply_cli_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(ref socket) = overrides.socket_path {
        config.daemon.socket_path = Some(socket.clone());
    }

    if let Some(port) = overrides.tcp_port {
        config.daemon.tcp_port = Some(port);
    }

    if let Some(plan_mode) = overrides.plan_mode {
        config.daemon.plan_mode = plan_mode;
    }
}
