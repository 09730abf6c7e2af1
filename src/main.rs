//! # Repository Updater Entry Point
//!
//! `run` (the default) starts the scheduler and its workers; `check` inspects a
//! single origin and prints what its strategy reports.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use repo_updater::config::ConfigLoader;
use repo_updater::service::run_service;
use repo_updater::strategy::StrategyRegistry;
use repo_updater::telemetry::init_tracing;
use repo_updater::types::Family;

#[derive(Debug, Parser)]
#[command(name = "repo-updater", version, about = "Keeps local repository mirrors up to date")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler, executor, purge worker and source syncer
    Run,
    /// Check an origin without touching local storage
    Check {
        #[arg(long)]
        family: Family,
        origin: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            if let Ok(redacted_json) = config.redacted_json() {
                info!(config = %redacted_json, "Loaded configuration for profile {}", config.profile);
            }

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown signal received");
                        signal.cancel();
                    }
                    Err(err) => warn!(error = %err, "Failed to listen for shutdown signal"),
                }
            });

            run_service(config, shutdown).await
        }
        Command::Check { family, origin } => {
            let strategy = StrategyRegistry::from_config(&config)?.get(family)?;

            let cloneable = strategy.is_cloneable(&origin).await;
            let remote = strategy.describe_remote(&origin).await;
            let report = json!({
                "family": family,
                "origin": origin,
                "cloneable": cloneable.is_ok(),
                "cloneable_error": cloneable.err(),
                "remote": remote.as_ref().ok(),
                "remote_error": remote.as_ref().err(),
            });

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
