//! rqctl - command-line client for the research job queue server.
//!
//! Submits and inspects jobs, triggers batches and cleanup, and reports
//! queue statistics and store health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, job, stats};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Research queue CLI
#[derive(Parser)]
#[command(
    name = "rqctl",
    version,
    about = "Research job queue client",
    long_about = "Submit research jobs, inspect their state and operate the research queue server.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "RQ_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Show queue statistics
    Stats(stats::StatsArgs),

    /// Check server and store health
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
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Stats(args) => stats::execute(args, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
