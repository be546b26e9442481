//! Ping command implementation.

use crate::client::Client;
use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

/// Log in to a running server and ping it.
#[derive(Args, Debug)]
pub struct PingArgs {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:17070")]
    pub addr: SocketAddr,

    /// Name the server certificate is issued for.
    #[arg(long, default_value = "localhost")]
    pub server_name: String,

    /// CA certificate (PEM) to trust.
    #[arg(long)]
    pub ca: PathBuf,

    /// Entity tag to log in as.
    #[arg(long, default_value = "user-admin")]
    pub user: String,

    /// Password.
    #[arg(long, env = "KEEL_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Environment uuid to scope requests to.
    #[arg(long, default_value = "")]
    pub scope: String,
}

/// Run the ping command.
pub async fn run_ping(args: PingArgs) -> Result<()> {
    let ca_pem = std::fs::read(&args.ca)
        .with_context(|| format!("failed to read CA certificate: {}", args.ca.display()))?;

    let started = Instant::now();
    let client = Client::connect(args.addr, &args.server_name, &ca_pem)
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?
        .with_scope(args.scope);
    let login = client.login(&args.user, &args.password).await.context("login failed")?;
    client.ping().await.context("ping failed")?;

    println!("✓ {} is alive", args.addr);
    println!("  Logged in as: {}", login.tag);
    println!("  Environment:  {}", login.environment);
    println!("  Round trip:   {:?}", started.elapsed());

    client.close().await;
    Ok(())
}
