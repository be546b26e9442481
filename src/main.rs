//! Keel - unified CLI entrypoint.
//!
//! Usage:
//!   keel start --config config/keel.toml
//!   keel config validate --config config/keel.toml
//!   keel ping --addr 127.0.0.1:17070 --ca certs/ca.pem

use anyhow::Result;
use clap::Parser;
use keel::cli::commands::{run_config, run_ping, run_start};
use keel::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/keel.toml"));

    match cli.command {
        Commands::Start(args) => run_start(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(args),
        Commands::Ping(args) => run_ping(args).await,
    }
}
