//! cldctl engine CLI
//!
//! Thin outer surface over the engine library: apply, destroy and import
//! against module and state files on disk.

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod cmd;

#[derive(Parser)]
#[command(name = "cldctl-engine")]
#[command(about = "Native IaC execution engine for Docker, processes and crypto artifacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("cldctl_engine={}", log_level).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("cldctl-engine v{}", env!("CARGO_PKG_VERSION"));

    cmd::run(cli.command).await
}
