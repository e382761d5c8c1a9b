use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod render;

#[derive(Parser)]
#[command(name = "campaign", about = "Campaign performance and optimization engine")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true, env = "CAMPAIGN_DB")]
    db: Option<PathBuf>,

    /// Extra config file layered over user and project config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest JSON Lines event files into the store
    Ingest(commands::ingest::IngestArgs),
    /// Run one optimization cycle
    Cycle(commands::cycle::CycleArgs),
    /// Run cycles on every campaign's polling interval until interrupted
    Watch(commands::watch::WatchArgs),
    /// Show stored allocation history and tests for a campaign
    Report(commands::report::ReportArgs),
    /// List and resolve fraud alerts
    Alerts(commands::alerts::AlertsArgs),
    /// Manage A/B tests
    Test(commands::test::TestArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ctx = commands::Context::new(cli.db, cli.config);

    match cli.command {
        Commands::Ingest(args) => commands::ingest::run(&ctx, args).await,
        Commands::Cycle(args) => commands::cycle::run(&ctx, args).await,
        Commands::Watch(args) => commands::watch::run(&ctx, args).await,
        Commands::Report(args) => commands::report::run(&ctx, args).await,
        Commands::Alerts(args) => commands::alerts::run(&ctx, args).await,
        Commands::Test(args) => commands::test::run(&ctx, args).await,
        Commands::Config(args) => commands::config::run(&ctx, args),
    }
}
