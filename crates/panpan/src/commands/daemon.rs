//! Daemon management commands

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use serde_json::json;

use super::CliContext;

/// Daemon management commands
#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    command: DaemonCommands,
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Start the daemon if it is not running
    Start,
    /// Ask the daemon to shut down
    Stop,
    /// Stop, then start the daemon
    Restart,
    /// Show whether the daemon answers
    Status(StatusArgs),
}

/// Show daemon status
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute daemon command
pub async fn execute(args: DaemonArgs, ctx: &CliContext) -> Result<()> {
    let lifecycle = &ctx.lifecycle;
    match args.command {
        DaemonCommands::Start => {
            lifecycle.start().await.context("Failed to start daemon")?;
            println!("Daemon running on {}", lifecycle.endpoint());
        }
        DaemonCommands::Stop => {
            if !lifecycle.is_running().await {
                println!("Daemon is not running");
                return Ok(());
            }
            lifecycle.stop().await;
            println!("Daemon stopped");
        }
        DaemonCommands::Restart => {
            lifecycle.restart().await.context("Failed to restart daemon")?;
            println!("Daemon restarted on {}", lifecycle.endpoint());
        }
        DaemonCommands::Status(status_args) => execute_status(status_args, ctx).await?,
    }
    Ok(())
}

async fn execute_status(args: StatusArgs, ctx: &CliContext) -> Result<()> {
    let lifecycle = &ctx.lifecycle;
    let running = lifecycle.is_running().await;
    let pid = read_pid(&lifecycle.options().home);

    if args.json {
        let output = json!({
            "running": running,
            "endpoint": lifecycle.endpoint().to_string(),
            "pid": pid,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Daemon Status");
        println!("=============");
        println!("Running:     {}", if running { "yes" } else { "no" });
        println!("Endpoint:    {}", lifecycle.endpoint());
        if let Some(pid) = pid {
            println!("PID:         {pid}");
        }
    }

    if !running {
        bail!("Daemon is not running");
    }
    Ok(())
}

/// PID recorded by the daemon, if the file exists and parses.
fn read_pid(home: &std::path::Path) -> Option<u32> {
    let content = std::fs::read_to_string(panpan_core::home::pid_path(home)).ok()?;
    content.trim().parse().ok()
}
