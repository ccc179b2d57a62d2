//! panpan - hand prompts to a background agent daemon and follow their output
//!
//! A thin CLI over the daemon client: every command connects to (or starts)
//! `panpan-daemon`, issues a few requests, prints the result and exits.

use clap::Parser;

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() {
    panpan_core::logging::init();

    let cli = Cli::parse();

    if let Err(e) = cli.execute().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
