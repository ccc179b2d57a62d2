//! Show the status of a task

use anyhow::{Context, Result};
use clap::Args;

use super::CliContext;

/// Show the status of a task
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Task ID
    task: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute status command
pub async fn execute(args: StatusArgs, ctx: &CliContext) -> Result<()> {
    let client = ctx.client().await?;
    let status = client
        .get_status(&args.task)
        .await
        .with_context(|| format!("Failed to get status of task {}", args.task))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Task:      {}", status.task_id);
    println!("Session:   {}", status.session_id);
    println!("Status:    {}", status.status);
    println!("Output:    {} chunk(s)", status.output_count);
    println!("Started:   {}", status.started_at.to_rfc3339());
    if let Some(completed_at) = status.completed_at {
        println!("Completed: {}", completed_at.to_rfc3339());
    }
    Ok(())
}
