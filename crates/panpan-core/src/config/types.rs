//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::Endpoint;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Daemon configuration: `[daemon]`
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Client configuration: `[client]`
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Endpoint both the daemon and its clients use.
    pub fn endpoint(&self, home: &Path) -> Endpoint {
        Endpoint::for_platform(home, self.daemon.socket_path.clone(), self.daemon.tcp_port)
    }
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket path (default: `<home>/.panpan/daemon.sock`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Loopback TCP port on platforms without Unix sockets (default: 19527)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    /// Seconds a terminal task's output stays readable before it is reclaimed
    pub output_retention_secs: u64,
    /// Upper bound on model turns per execution
    pub max_turns: usize,
    /// Reject tools that are not read-only unless allow-listed
    pub plan_mode: bool,
    /// Tools allowed to run while plan mode is active
    pub plan_mode_allow: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            tcp_port: None,
            output_retention_secs: 600,
            max_turns: 25,
            plan_mode: false,
            plan_mode_allow: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn output_retention(&self) -> Duration {
        Duration::from_secs(self.output_retention_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-request response timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Delay between output polls when following a task
    pub poll_interval_ms: u64,
    /// How long `daemon start` waits for the daemon to answer a ping
    pub startup_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            poll_interval_ms: 100,
            startup_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}
