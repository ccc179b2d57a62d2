//! Daemon lifecycle management: probe, start, stop, restart.
//!
//! [`DaemonLifecycle`] is an ordinary value built once by the CLI at startup
//! and passed to whatever needs it. It owns no connection; every operation
//! connects fresh, so a daemon that died between calls is simply reported as
//! not running.
//!
//! Starting the daemon spawns the `panpan-daemon` binary detached from the
//! caller: stdin and stdout go to the null device, stderr is appended to
//! `<home>/.panpan/daemon.log`, and on Unix the child gets its own process
//! group so a Ctrl-C in the caller's terminal does not reach it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClientError, DaemonClient, try_connect};
use crate::config::Config;
use crate::home::{HOME_ENV, log_path, state_dir};
use crate::transport::Endpoint;

/// Environment variable naming the daemon executable explicitly.
pub const DAEMON_BIN_ENV: &str = "PANPAN_DAEMON_BIN";

/// File name of the daemon executable.
pub const DAEMON_BIN_NAME: &str = "panpan-daemon";

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No daemon executable could be located.
    #[error("daemon executable not found: {0}")]
    EntryPointNotFound(String),

    /// The daemon process could not be spawned.
    #[error("failed to spawn daemon {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The daemon was spawned but never answered a ping.
    #[error("daemon did not become reachable at {endpoint} within {timeout:?}")]
    StartupTimeout { endpoint: String, timeout: Duration },

    /// The daemon is still unreachable after a start attempt.
    #[error("daemon unreachable at {0}")]
    Unreachable(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Tunables for [`DaemonLifecycle`].
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub endpoint: Endpoint,
    /// Home directory handed to the daemon via `PANPAN_HOME`.
    pub home: PathBuf,
    /// Explicit daemon executable; discovered when `None`.
    pub daemon_bin: Option<PathBuf>,
    /// How long `start` waits for the daemon to answer.
    pub startup_timeout: Duration,
    /// Delay between reachability probes during `start`.
    pub startup_poll_interval: Duration,
    /// Pause between stop and start in `restart`.
    pub restart_delay: Duration,
    /// Request timeout for clients this manager hands out.
    pub request_timeout: Duration,
    /// Output poll interval for clients this manager hands out.
    pub output_poll_interval: Duration,
}

impl LifecycleOptions {
    /// Defaults for `endpoint`, with the daemon executable taken from
    /// `PANPAN_DAEMON_BIN` when set.
    pub fn new(endpoint: Endpoint, home: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            home: home.into(),
            daemon_bin: std::env::var_os(DAEMON_BIN_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            startup_timeout: Duration::from_secs(5),
            startup_poll_interval: Duration::from_millis(100),
            restart_delay: Duration::from_millis(500),
            request_timeout: crate::client::DEFAULT_REQUEST_TIMEOUT,
            output_poll_interval: crate::client::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Options derived from resolved configuration.
    pub fn from_config(config: &Config, home: &Path) -> Self {
        let mut options = Self::new(config.endpoint(home), home);
        options.startup_timeout = config.client.startup_timeout();
        options.request_timeout = config.client.request_timeout();
        options.output_poll_interval = config.client.poll_interval();
        options
    }
}

/// Starts, stops and probes the daemon.
#[derive(Debug, Clone)]
pub struct DaemonLifecycle {
    options: LifecycleOptions,
}

impl DaemonLifecycle {
    pub fn new(options: LifecycleOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.options.endpoint
    }

    /// Connect a client, or `None` when nothing answers.
    pub async fn connect(&self) -> Option<DaemonClient> {
        try_connect(&self.options.endpoint).await.map(|client| {
            client
                .with_timeout(self.options.request_timeout)
                .with_poll_interval(self.options.output_poll_interval)
        })
    }

    /// Whether a daemon answers a ping at the endpoint. Never errors.
    pub async fn is_running(&self) -> bool {
        match self.connect().await {
            Some(client) => match client.ping().await {
                Ok(()) => true,
                Err(e) => {
                    debug!("Daemon at {} did not answer ping: {e}", self.endpoint());
                    false
                }
            },
            None => false,
        }
    }

    /// Start the daemon unless one is already reachable, and wait until it
    /// answers.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::EntryPointNotFound`] / [`LifecycleError::Spawn`] when
    /// the process cannot be launched, [`LifecycleError::StartupTimeout`] when
    /// it never answers.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        if self.is_running().await {
            debug!("Daemon already running at {}", self.endpoint());
            return Ok(());
        }

        let bin = self.resolve_entry_point()?;
        info!("Starting daemon {} at {}", bin.display(), self.endpoint());
        let mut child = self.spawn(&bin)?;

        let deadline = Instant::now() + self.options.startup_timeout;
        let mut exited = false;
        loop {
            if self.is_running().await {
                info!("Daemon is up at {}", self.endpoint());
                return Ok(());
            }

            if !exited {
                if let Ok(Some(status)) = child.try_wait() {
                    // Keep polling: a concurrent start may still bring one up.
                    warn!(
                        "Daemon process exited early with {status}; see {}",
                        log_path(&self.options.home).display()
                    );
                    exited = true;
                }
            }

            if Instant::now() >= deadline {
                return Err(LifecycleError::StartupTimeout {
                    endpoint: self.endpoint().to_string(),
                    timeout: self.options.startup_timeout,
                });
            }
            tokio::time::sleep(self.options.startup_poll_interval).await;
        }
    }

    /// Ask a reachable daemon to shut down. Errors are logged and swallowed.
    pub async fn stop(&self) {
        let Some(client) = self.connect().await else {
            debug!("No daemon to stop at {}", self.endpoint());
            return;
        };
        match client.shutdown().await {
            Ok(()) => info!("Daemon at {} acknowledged shutdown", self.endpoint()),
            Err(e) => warn!("Shutdown request failed: {e}"),
        }
    }

    /// Stop, wait the restart delay, start.
    pub async fn restart(&self) -> Result<(), LifecycleError> {
        self.stop().await;
        tokio::time::sleep(self.options.restart_delay).await;
        self.start().await
    }

    /// A connected client, starting the daemon first if needed.
    pub async fn ensure_running(&self) -> Result<DaemonClient, LifecycleError> {
        if let Some(client) = self.connect().await {
            if client.ping().await.is_ok() {
                return Ok(client);
            }
        }

        self.start().await?;

        self.connect()
            .await
            .ok_or_else(|| LifecycleError::Unreachable(self.endpoint().to_string()))
    }

    /// Locate the daemon executable.
    ///
    /// Order: explicit option (or `PANPAN_DAEMON_BIN`), a `panpan-daemon` next
    /// to the current executable, then `panpan-daemon` on `PATH`.
    pub fn resolve_entry_point(&self) -> Result<PathBuf, LifecycleError> {
        let file_name = format!("{DAEMON_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);

        if let Some(ref explicit) = self.options.daemon_bin {
            if explicit.is_file() {
                return Ok(explicit.clone());
            }
            return Err(LifecycleError::EntryPointNotFound(format!(
                "{} does not exist",
                explicit.display()
            )));
        }

        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let sibling = dir.join(&file_name);
                if sibling.is_file() {
                    return Ok(sibling);
                }
            }
        }

        if let Some(path) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path) {
                let candidate = dir.join(&file_name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        Err(LifecycleError::EntryPointNotFound(format!(
            "{file_name} not found next to the current executable or on PATH \
             (set {DAEMON_BIN_ENV} to override)"
        )))
    }

    fn spawn(&self, bin: &Path) -> Result<tokio::process::Child, LifecycleError> {
        let mut cmd = tokio::process::Command::new(bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(self.daemon_log())
            .env(HOME_ENV, &self.options.home);

        for (key, value) in self.options.endpoint.env_vars() {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|source| LifecycleError::Spawn {
            path: bin.to_path_buf(),
            source,
        })
    }

    /// Append-mode handle on the daemon log, or the null device if it cannot
    /// be opened.
    fn daemon_log(&self) -> Stdio {
        let path = log_path(&self.options.home);
        let opened = std::fs::create_dir_all(state_dir(&self.options.home)).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
        });
        match opened {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!("Cannot open daemon log {}: {e}", path.display());
                Stdio::null()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(home: &Path, endpoint: Endpoint) -> LifecycleOptions {
        let mut options = LifecycleOptions::new(endpoint, home);
        options.daemon_bin = None;
        options.startup_timeout = Duration::from_millis(300);
        options.startup_poll_interval = Duration::from_millis(20);
        options.restart_delay = Duration::from_millis(10);
        options.request_timeout = Duration::from_millis(500);
        options
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_is_running_false_for_dead_socket() {
        let home = TempDir::new().unwrap();
        let endpoint = Endpoint::default_for_platform(home.path());
        let lifecycle = DaemonLifecycle::new(options(home.path(), endpoint));
        assert!(!lifecycle.is_running().await);
        // Stopping nothing is fine.
        lifecycle.stop().await;
    }

    #[test]
    fn test_explicit_missing_entry_point() {
        let home = TempDir::new().unwrap();
        let mut opts = options(home.path(), Endpoint::Tcp(1));
        opts.daemon_bin = Some(home.path().join("no-such-daemon"));
        let lifecycle = DaemonLifecycle::new(opts);
        assert!(matches!(
            lifecycle.resolve_entry_point(),
            Err(LifecycleError::EntryPointNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_times_out_when_daemon_never_answers() {
        let home = TempDir::new().unwrap();
        let endpoint = Endpoint::default_for_platform(home.path());
        let mut opts = options(home.path(), endpoint);
        opts.daemon_bin = Some(PathBuf::from("/bin/sh"));
        let lifecycle = DaemonLifecycle::new(opts);

        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartupTimeout { .. }), "got {err:?}");
        assert!(log_path(home.path()).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ensure_running_reports_missing_entry_point() {
        let home = TempDir::new().unwrap();
        let endpoint = Endpoint::default_for_platform(home.path());
        let mut opts = options(home.path(), endpoint);
        opts.daemon_bin = Some(home.path().join("missing"));
        let lifecycle = DaemonLifecycle::new(opts);

        let err = lifecycle.ensure_running().await.unwrap_err();
        assert!(matches!(err, LifecycleError::EntryPointNotFound(_)));
    }
}
