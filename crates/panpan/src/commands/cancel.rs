//! Cancel a running task

use anyhow::{Context, Result, bail};
use clap::Args;

use super::CliContext;

/// Cancel a running task
#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Task ID
    task: String,
}

/// Execute cancel command
pub async fn execute(args: CancelArgs, ctx: &CliContext) -> Result<()> {
    let client = ctx.client().await?;
    let cancelled = client
        .cancel(&args.task)
        .await
        .with_context(|| format!("Failed to cancel task {}", args.task))?;

    if !cancelled {
        bail!("Task {} is not running", args.task);
    }
    println!("Cancelled task {}", args.task);
    Ok(())
}
