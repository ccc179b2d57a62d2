//! List sessions

use anyhow::{Context, Result};
use clap::Args;
use panpan_core::protocol::{SessionListFilter, SessionStatus};

use super::CliContext;

/// List sessions
#[derive(Args, Debug)]
pub struct SessionsArgs {
    /// Only sessions with this status (active, completed, failed, cancelled)
    #[arg(long, value_parser = parse_session_status)]
    status: Option<SessionStatus>,

    /// Only sessions for this project root
    #[arg(long, value_name = "DIR")]
    project: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute sessions command
pub async fn execute(args: SessionsArgs, ctx: &CliContext) -> Result<()> {
    let client = ctx.client().await?;
    let sessions = client
        .list_sessions(&SessionListFilter {
            status: args.status,
            project_root: args.project,
        })
        .await
        .context("Failed to list sessions")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!("{:<36}  {:<9}  {:<20}  PROJECT", "ID", "STATUS", "UPDATED");
    for session in &sessions {
        println!(
            "{:<36}  {:<9}  {:<20}  {}",
            session.id,
            session.status.to_string(),
            session.updated_at.format("%Y-%m-%d %H:%M:%S"),
            session.project_root
        );
    }
    Ok(())
}

fn parse_session_status(s: &str) -> Result<SessionStatus, String> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| format!("unknown session status '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_status() {
        assert_eq!(parse_session_status("active"), Ok(SessionStatus::Active));
        assert_eq!(parse_session_status("Cancelled"), Ok(SessionStatus::Cancelled));
        assert!(parse_session_status("paused").is_err());
    }
}
