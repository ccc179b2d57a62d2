//! Run a prompt in the daemon

use anyhow::{Context, Result};
use clap::Args;
use panpan_core::protocol::ExecuteParams;
use std::path::PathBuf;

use super::CliContext;
use super::output::follow;

/// Run a prompt in the daemon
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Prompt text
    prompt: String,

    /// Existing session to run in (a new session is created otherwise)
    #[arg(short, long, value_name = "ID")]
    session: Option<String>,

    /// Model identifier passed to the model client
    #[arg(short, long, default_value = "default")]
    model: String,

    /// Project root (default: current directory)
    #[arg(short, long, value_name = "DIR")]
    project: Option<PathBuf>,

    /// System prompt for the run
    #[arg(long, value_name = "TEXT")]
    system_prompt: Option<String>,

    /// Return immediately after the task is created
    #[arg(short, long)]
    detach: bool,

    /// Print raw chunks as JSON lines
    #[arg(long)]
    json: bool,
}

/// Execute run command
pub async fn execute(args: RunArgs, ctx: &CliContext) -> Result<()> {
    let project_root = match args.project {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let client = ctx.client().await?;
    let started = client
        .execute(&ExecuteParams {
            prompt: args.prompt,
            session_id: args.session,
            model: args.model,
            project_root: project_root.to_string_lossy().into_owned(),
            system_prompt: args.system_prompt,
            llm_config: None,
        })
        .await
        .context("Failed to start execution")?;

    if args.detach {
        println!("{}", started.task_id);
        eprintln!("Follow with: panpan output {} --follow", started.task_id);
        return Ok(());
    }

    tokio::select! {
        result = follow(&client, &started.task_id, args.json) => result?,
        _ = tokio::signal::ctrl_c() => {
            // The task keeps running in the daemon.
            eprintln!();
            eprintln!("Detached from task {}", started.task_id);
            eprintln!("Reattach with: panpan output {} --follow", started.task_id);
            return Ok(());
        }
    }

    let status = client.get_status(&started.task_id).await?;
    if !args.json {
        eprintln!("Task {} {}", status.task_id, status.status);
    }
    if status.status != panpan_core::TaskStatus::Completed {
        anyhow::bail!("Task {} ended as {}", status.task_id, status.status);
    }
    Ok(())
}
