//! List the tasks of a session

use anyhow::{Context, Result};
use clap::Args;

use super::CliContext;

/// List the tasks of a session
#[derive(Args, Debug)]
pub struct TasksArgs {
    /// Session ID
    session: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute tasks command
pub async fn execute(args: TasksArgs, ctx: &CliContext) -> Result<()> {
    let client = ctx.client().await?;
    let tasks = client
        .list_tasks(&args.session)
        .await
        .with_context(|| format!("Failed to list tasks of session {}", args.session))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks in session {}", args.session);
        return Ok(());
    }

    println!("{:<36}  {:<9}  {:<20}  DESCRIPTION", "ID", "STATUS", "STARTED");
    for task in &tasks {
        println!(
            "{:<36}  {:<9}  {:<20}  {}",
            task.id,
            task.status.to_string(),
            task.started_at.format("%Y-%m-%d %H:%M:%S"),
            task.description
        );
    }
    Ok(())
}
