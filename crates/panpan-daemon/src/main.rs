//! panpan daemon - background service for sessions, tasks and prompt execution

use anyhow::{Context, Result};
use clap::Parser;
use panpan_core::config::{ConfigOverrides, resolve_config};
use panpan_daemon::agent::EchoModel;
use panpan_daemon::store::MemorySessionStore;
use panpan_daemon::tool::{PlanMode, ToolRegistry};
use panpan_daemon::{DaemonState, ExecutionManager, ExecutionSettings, start_server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// panpan daemon - background service for sessions, tasks and prompt execution
#[derive(Parser, Debug)]
#[command(name = "panpan-daemon")]
#[command(about = "Background service for panpan sessions, tasks and prompt execution")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Unix socket path to listen on
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Loopback TCP port to listen on (platforms without Unix sockets)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Reject tools that are neither read-only nor allow-listed
    #[arg(long)]
    plan_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        panpan_core::logging::init_with_level(tracing::Level::DEBUG);
    } else {
        panpan_core::logging::init();
    }

    info!("panpan daemon starting...");

    let home_dir = panpan_core::home::get_home_dir().context("Failed to determine home directory")?;

    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        socket_path: args.socket.clone(),
        tcp_port: args.port,
        plan_mode: args.plan_mode.then_some(true),
    };
    let config = resolve_config(&overrides, &home_dir).context("Failed to resolve configuration")?;
    let endpoint = config.endpoint(&home_dir);

    let settings = ExecutionSettings {
        max_turns: config.daemon.max_turns,
        plan_mode: PlanMode::new(config.daemon.plan_mode, config.daemon.plan_mode_allow.clone()),
    };
    if settings.plan_mode.active {
        info!("Plan mode active");
    }

    let executor = Arc::new(ExecutionManager::new(
        Arc::new(MemorySessionStore::new()),
        Arc::new(EchoModel),
        Arc::new(ToolRegistry::new()),
        settings,
    ));

    // Create cancellation token for graceful shutdown
    let shutdown = CancellationToken::new();
    let state = Arc::new(DaemonState::new(executor.clone(), shutdown.clone()));

    let server = start_server(&endpoint, &home_dir, state)
        .await
        .context("Failed to start daemon server")?;

    tokio::spawn(
        executor
            .clone()
            .run_retention(config.daemon.output_retention(), shutdown.clone()),
    );

    // Set up signal handlers
    let cancel_for_signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_for_signals.cancel();
    });

    info!("panpan daemon ready on {}", server.endpoint());
    shutdown.cancelled().await;

    info!("panpan daemon shutting down");
    executor.cancel_all().await;
    drop(server);

    info!("panpan daemon shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT (Ctrl+C)");
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    }
}
