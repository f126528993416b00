//! Wallet-Confluence Detection Service
//!
//! Watches tracker channels through upstream relay sessions, detects wallet
//! confluences per tenant, and serves recap analytics over the detection
//! history.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use wallet_confluence::cli::commands;
use wallet_confluence::config::Config;
use wallet_confluence::model::TrackerType;

/// Wallet-confluence detector for tracker channels
#[derive(Parser)]
#[command(name = "confluence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the detection service
    Start {
        /// Run with the in-memory store (nothing persisted)
        #[arg(long)]
        dry_run: bool,
    },

    /// Show active subscriptions and recent detections
    Status,

    /// Show current configuration (secrets masked)
    Config,

    /// Build a recap for a tenant over a trailing window
    Recap {
        /// Tenant (group) id
        #[arg(long)]
        tenant: i64,

        /// Window in hours (clamped to 1..168)
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Subscribe a tracker for a tenant
    Subscribe {
        /// Tracker handle or stringified channel id
        tracker: String,

        /// Tenant (group) id
        #[arg(long)]
        tenant: i64,

        /// Tracker message format: a, b, or c
        #[arg(long, value_name = "TYPE")]
        tracker_type: TrackerType,

        /// Operator performing the setup
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Remove a tracker subscription (evicts buckets, purges history)
    Unsubscribe {
        /// Tracker handle
        tracker: String,

        /// Tenant (group) id
        #[arg(long)]
        tenant: i64,
    },

    /// View or adjust tenant detection settings
    Settings {
        /// Tenant (group) id
        #[arg(long)]
        tenant: i64,

        /// Distinct wallets required for a detection (2..10)
        #[arg(long)]
        min_wallets: Option<u32>,

        /// Sliding window in minutes (60..2880)
        #[arg(long)]
        window_minutes: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("startup failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Start { dry_run } => commands::start(config, dry_run).await,
        Commands::Status => commands::status(config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Recap { tenant, hours } => commands::recap(config, tenant, hours).await,
        Commands::Subscribe {
            tracker,
            tenant,
            tracker_type,
            actor,
        } => commands::subscribe(config, tracker, tenant, tracker_type, actor).await,
        Commands::Unsubscribe { tracker, tenant } => {
            commands::unsubscribe(config, tracker, tenant).await
        }
        Commands::Settings {
            tenant,
            min_wallets,
            window_minutes,
        } => commands::settings(config, tenant, min_wallets, window_minutes).await,
    }
}
