//! Framed request/response server.
//!
//! The daemon listens on the platform endpoint (a Unix domain socket at
//! `<home>/.panpan/daemon.sock`, or loopback TCP elsewhere). Each connection
//! carries any number of length-prefixed JSON requests; every request gets
//! exactly one response carrying the same `id`.
//!
//! A framing error is fatal to its connection only. Domain failures become
//! `success: false` responses.

mod connection;
mod dispatch;

pub use dispatch::{DispatchError, dispatch};

use anyhow::{Context, Result, bail};
use panpan_core::transport::{Endpoint, Listener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::execution::ExecutionManager;
use crate::store::SharedSessionStore;

/// Everything a request handler can reach.
pub struct DaemonState {
    pub store: SharedSessionStore,
    pub executor: Arc<ExecutionManager>,
    /// Cancelled by a `shutdown` request or a signal.
    pub shutdown: CancellationToken,
}

impl DaemonState {
    pub fn new(executor: Arc<ExecutionManager>, shutdown: CancellationToken) -> Self {
        Self {
            store: executor.store().clone(),
            executor,
            shutdown,
        }
    }
}

/// A running server. Dropping it removes the socket and PID files.
pub struct ServerHandle {
    endpoint: Endpoint,
    socket_path: Option<PathBuf>,
    pid_path: PathBuf,
}

impl ServerHandle {
    /// The bound endpoint. For TCP port 0 this carries the real port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(socket_path) = &self.socket_path {
            remove_file_logged(socket_path, "socket");
        }
        remove_file_logged(&self.pid_path, "PID");
    }
}

fn remove_file_logged(path: &Path, what: &str) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {what} file {}", path.display()),
        Err(e) => warn!("Failed to remove {what} file {}: {e}", path.display()),
    }
}

/// Bind `endpoint`, write the PID file and spawn the accept loop.
///
/// The loop stops when `state.shutdown` is cancelled.
///
/// # Errors
///
/// Fails when another daemon already answers on the socket, or when the
/// state directory, PID file or listener cannot be created.
pub async fn start_server(endpoint: &Endpoint, home: &Path, state: Arc<DaemonState>) -> Result<ServerHandle> {
    let state_dir = panpan_core::home::state_dir(home);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let socket_path = match endpoint {
        Endpoint::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            if path.exists() {
                if panpan_core::client::try_connect(endpoint).await.is_some() {
                    bail!("A daemon is already running on {endpoint}");
                }
                warn!("Removing stale socket file: {}", path.display());
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
            }
            Some(path.clone())
        }
        Endpoint::Tcp(_) => None,
    };

    let listener = endpoint
        .bind()
        .await
        .with_context(|| format!("Failed to bind {endpoint}"))?;
    let bound = match listener.local_port() {
        Some(port) => Endpoint::Tcp(port),
        None => endpoint.clone(),
    };

    let pid_path = panpan_core::home::pid_path(home);
    let pid = std::process::id();
    std::fs::write(&pid_path, format!("{pid}\n"))
        .with_context(|| format!("Failed to write PID file {}", pid_path.display()))?;
    debug!("Wrote PID {pid} to {}", pid_path.display());

    info!("Daemon listening on {bound}");
    let loop_endpoint = bound.clone();
    tokio::spawn(async move {
        run_accept_loop(listener, state, &loop_endpoint).await;
    });

    Ok(ServerHandle {
        endpoint: bound,
        socket_path,
        pid_path,
    })
}

async fn run_accept_loop(listener: Listener, state: Arc<DaemonState>, endpoint: &Endpoint) {
    debug!("Accept loop started");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("Server stopping");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((reader, writer)) => {
                        let state = state.clone();
                        tokio::spawn(connection::handle_connection(reader, writer, state));
                    }
                    Err(e) => {
                        error!("Accept error on {endpoint}: {e}");
                        // Avoid a tight loop on persistent accept failures.
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    debug!("Accept loop stopped");
}
