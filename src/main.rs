//! Chat Hub - Server-Sent Events chat room
//!
//! A single-room chat server: browsers subscribe over SSE, post messages over
//! plain HTTP forms, and every message is persisted to SQLite.

mod api;
mod config;
mod error;
mod hub;
mod models;
mod render;
mod storage;
mod stream;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::storage::{MessageStore, Storage};

#[derive(Parser)]
#[command(name = "chat-hub")]
#[command(about = "Real-time chat room over Server-Sent Events")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    Serve {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,

        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show stored message statistics
    Stats {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Delete old messages
    Purge {
        /// Delete messages older than this many days
        #[arg(long)]
        days: u32,

        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },

    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Serve { config, .. }
        | Commands::Stats { config, .. }
        | Commands::Purge { config, .. } => config.clone(),
        _ => None,
    };
    let config = Config::resolve(config_path.as_deref())?;

    init_logging(&cli, &config);

    match cli.command {
        Commands::Serve { host, port, .. } => {
            run_server(config, host, port).await?;
        }
        Commands::Stats { json, .. } => {
            show_stats(&config, json).await?;
        }
        Commands::Purge { days, .. } => {
            run_purge(&config, days).await?;
        }
        Commands::Config { show, init } => {
            manage_config(&config, show, init)?;
        }
        Commands::Version => {
            println!("chat-hub v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// `RUST_LOG` wins, then the command-line flags, then the configured level.
fn init_logging(cli: &Cli, config: &Config) {
    let fallback = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        config.log_level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn open_storage(config: &Config) -> Result<Storage> {
    let storage = Storage::new(&config.db_path).await?;
    storage.initialize().await?;
    Ok(storage)
}

async fn run_server(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.http_port = port;
    }

    config.ensure_dirs()?;
    info!("Starting chat hub v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {:?}", config.db_path);

    let storage = open_storage(&config).await?;
    api::run_web_server(&config, Arc::new(storage)).await?;

    info!("Chat hub stopped");
    Ok(())
}

async fn show_stats(config: &Config, json_output: bool) -> Result<()> {
    if !config.db_path.exists() {
        if json_output {
            println!(r#"{{"error": "Database not found"}}"#);
        } else {
            eprintln!("Database not found at {:?}", config.db_path);
        }
        return Ok(());
    }

    let storage = open_storage(config).await?;
    let total = storage.count_all().await?;
    let latest = storage.recent(1).await?.pop();

    if json_output {
        let output = serde_json::json!({
            "total_messages": total,
            "latest_message_at": latest.map(|m| m.created_at),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Database:       {:?}", config.db_path);
    println!("Total messages: {}", total);
    if let Some(latest) = latest {
        println!(
            "Latest message: {}",
            latest.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

async fn run_purge(config: &Config, days: u32) -> Result<()> {
    if !config.db_path.exists() {
        eprintln!("Database not found at {:?}", config.db_path);
        return Ok(());
    }

    let storage = open_storage(config).await?;
    let removed = storage
        .purge_older_than(chrono::Duration::days(i64::from(days)))
        .await?;
    println!("Removed {} message(s) older than {} day(s)", removed, days);

    Ok(())
}

/// `--init` writes the defaults; showing is the default action and also
/// follows `--init` when `--show` is given.
fn manage_config(config: &Config, show: bool, init: bool) -> Result<()> {
    let config_path = config.config_file();

    if init {
        let defaults = Config::default();
        defaults.ensure_dirs()?;
        defaults.save(&defaults.config_file().to_string_lossy())?;
        println!("Configuration created at {:?}", defaults.config_file());
        if !show {
            return Ok(());
        }
    }

    if !config_path.exists() {
        println!("No config file found, showing defaults");
    }
    println!("{}", serde_json::to_string_pretty(config)?);

    Ok(())
}
