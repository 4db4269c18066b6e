//! Vantage CLI - Command-line interface for managing A/B-testing experiments.
//!
//! Provides commands for experiment lifecycle, live watching, health, and
//! configuration management.

mod client;
mod commands;
mod output;
mod sync;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, experiment, health, watch};
use output::OutputFormat;

/// Vantage - A/B experiment engine CLI
#[derive(Parser)]
#[command(
    name = "vantage",
    version = "0.1.0",
    about = "Vantage - A/B experiment engine",
    long_about = "CLI tool for managing Vantage experiments: lifecycle operations, \
                  live result watching, and configuration.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "VANTAGE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Experiment lifecycle operations
    #[command(subcommand)]
    Experiment(experiment::ExperimentCommands),

    /// Watch an experiment's live results
    Watch(watch::WatchArgs),

    /// Check server health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Experiment(cmd) => experiment::execute(cmd, &client, format).await,
        Commands::Watch(args) => watch::execute(args, &client).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
