use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use slipcheck_core::SlipcheckConfig;

mod args;
mod commands;
mod intake;

use args::{Cli, Command};
use commands::Services;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let project_dirs = directories::ProjectDirs::from("org", "slipcheck", "slipcheck");

    let config_path = cli
        .config
        .or_else(|| project_dirs.as_ref().map(|d| d.config_dir().join("slipcheck.toml")));
    let config = match &config_path {
        Some(path) => SlipcheckConfig::load_or_default(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SlipcheckConfig::default(),
    };

    let data_dir = config
        .storage
        .data_dir
        .clone()
        .or_else(|| project_dirs.as_ref().map(|d| d.data_dir().to_path_buf()))
        .context("no data directory configured and no platform default available")?;

    tracing::info!(
        data_dir = %data_dir.display(),
        concurrency = config.queue.concurrency,
        match_threshold = config.verifier.match_threshold,
        "Starting slipcheck"
    );

    let services = Services::open(config, &data_dir).await?;

    match cli.command {
        Command::Verify(args) => {
            let slips = args.slips()?;
            commands::verify(&services, &slips).await
        }
        Command::Watch { dir } => commands::watch(&services, dir).await,
        Command::Status { id } => commands::status(&services, &id).await,
    }
}
