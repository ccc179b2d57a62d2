//! CLI command dispatch and execution

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use panpan_core::config::{ConfigOverrides, resolve_config};
use panpan_core::lifecycle::LifecycleOptions;
use panpan_core::{DaemonClient, DaemonLifecycle};
use std::path::PathBuf;

mod cancel;
mod daemon;
mod output;
mod run;
mod sessions;
mod status;
mod tasks;

/// panpan - hand prompts to a background agent daemon and follow their output
#[derive(Parser, Debug)]
#[command(
    name = "panpan",
    version,
    about = "Run agent prompts in a background daemon and follow their output",
    long_about = "A thin CLI over the panpan daemon. Prompts keep running after the CLI exits; \
                  reattach later with `panpan output <task> --follow`."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start, stop or inspect the daemon
    Daemon(daemon::DaemonArgs),

    /// Run a prompt in the daemon
    Run(run::RunArgs),

    /// Show the status of a task
    Status(status::StatusArgs),

    /// Print a task's output
    Output(output::OutputArgs),

    /// Cancel a running task
    Cancel(cancel::CancelArgs),

    /// List sessions
    Sessions(sessions::SessionsArgs),

    /// List the tasks of a session
    Tasks(tasks::TasksArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let ctx = CliContext::load(self.config)?;
        match self.command {
            Commands::Daemon(args) => daemon::execute(args, &ctx).await,
            Commands::Run(args) => run::execute(args, &ctx).await,
            Commands::Status(args) => status::execute(args, &ctx).await,
            Commands::Output(args) => output::execute(args, &ctx).await,
            Commands::Cancel(args) => cancel::execute(args, &ctx).await,
            Commands::Sessions(args) => sessions::execute(args, &ctx).await,
            Commands::Tasks(args) => tasks::execute(args, &ctx).await,
        }
    }
}

/// Lifecycle manager built from the resolved configuration.
pub(crate) struct CliContext {
    pub lifecycle: DaemonLifecycle,
}

impl CliContext {
    fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let home_dir = panpan_core::home::get_home_dir()?;
        let overrides = ConfigOverrides {
            config_path,
            ..Default::default()
        };
        let config = resolve_config(&overrides, &home_dir).context("Failed to resolve configuration")?;
        let lifecycle = DaemonLifecycle::new(LifecycleOptions::from_config(&config, &home_dir));
        Ok(Self { lifecycle })
    }

    /// A client for a running daemon, starting one if necessary.
    pub async fn client(&self) -> Result<DaemonClient> {
        self.lifecycle
            .ensure_running()
            .await
            .context("Failed to reach the panpan daemon")
    }
}
