//! Migration Scout - adaptive scoring and scheduling for migrated tokens
//!
//! Scores tokens from DEX market metrics and on-chain transaction samples,
//! promotes or archives them, and tunes its own concurrency to load.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

// Use the library crate
use migration_scout::cli::commands;
use migration_scout::config::Config;

/// Migration Scout - adaptive token scoring pipeline
#[derive(Parser)]
#[command(name = "scout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SCOUT_LOG_JSON")]
    json: bool,

    /// Override a setting, e.g. `--set scoring.alpha=0.4` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    settings: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler
    Start {
        /// Token mint to track (repeatable)
        #[arg(long = "mint", value_name = "MINT")]
        mints: Vec<String>,

        /// File with one mint per line
        #[arg(long, value_name = "PATH")]
        mints_file: Option<PathBuf>,
    },

    /// Score one token now and print the snapshot as JSON
    Score {
        /// Token mint address
        mint: String,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check upstream reachability and resource usage
    Health,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("migration_scout=info".parse()?);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    // Load configuration; invalid configuration never reaches the scheduler
    let config = match Config::load(&cli.config)
        .and_then(|cfg| commands::apply_overrides(cfg, &cli.settings))
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start { mints, mints_file } => {
            commands::start(&config, mints, mints_file.as_deref()).await
        }
        Commands::Score { mint } => commands::score(&config, &mint).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
