//! Lottery Sync CLI
//!
//! Thin wrapper around lottery-sync-core for inspecting a client's local
//! cache and watching the sync layer at work.
//!
//! ## Usage
//!
//! ```bash
//! # Show client information
//! lottery-sync info
//!
//! # List every cached path
//! lottery-sync cache list
//!
//! # Read / write / remove a cached path
//! lottery-sync cache get lotteryState
//! lottery-sync cache set prizes '[{"id":"p1","name":"Bicycle"}]'
//! lottery-sync cache remove events
//!
//! # Print the effective configuration
//! lottery-sync config show
//!
//! # Three in-process clients play one round, with a display outage
//! lottery-sync demo
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lottery_sync_core::{
    paths, ClientRole, LegacyEngine, LotteryClient, LotteryState, MemoryHub, PrizeRef, Storage,
    SyncConfig, WinnerRef,
};
use serde_json::{json, Value};

/// Lottery Sync - shared lottery state with offline fallback
#[derive(Parser)]
#[command(name = "lottery-sync")]
#[command(version = "0.1.0")]
#[command(about = "Lottery Sync - shared lottery state with offline fallback")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.lottery-sync)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data dir>/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show client information
    Info,

    /// Local cache inspection
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run three in-process clients through one lottery round
    Demo {
        /// How long the display stays disconnected (ms)
        #[arg(long, default_value_t = 300)]
        outage_ms: u64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List every cached entry
    List,

    /// Print the cached value at a path
    Get {
        /// Remote path, e.g. lotteryState or events
        path: String,
    },

    /// Write a JSON value to the cache
    Set {
        /// Remote path
        path: String,

        /// JSON value
        value: String,
    },

    /// Remove a path and its children from the cache
    Remove {
        /// Remote path
        path: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.lottery-sync)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lottery-sync")
}

fn open_cache(data_dir: &Path) -> Result<Storage> {
    Storage::new(data_dir.join("cache.redb"))
        .with_context(|| format!("Failed to open cache in {}", data_dir.display()))
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Shorten a JSON value for one-line listings
fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 60 {
        let head: String = text.chars().take(57).collect();
        format!("{}...", head)
    } else {
        text
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config_path = cli
        .config
        .unwrap_or_else(|| data_dir.join("config.json"));
    let config = SyncConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    match cli.command {
        Commands::Info => {
            let storage = open_cache(&data_dir)?;
            let entries = storage.list()?;
            let events = entries
                .iter()
                .filter(|(key, _)| key.starts_with(&lottery_sync_core::cache_key("events/")))
                .count();

            println!("Lottery Sync v0.1.0");
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Config: {}", config_path.display());
            if !config.remote.url.is_empty() {
                println!("Remote: {}", config.remote.url);
            }
            println!();
            println!("Cache:");
            println!("  Entries: {}", entries.len());
            println!("  Events: {}", events);

            match storage.get(paths::STATE)? {
                Some(value) => match serde_json::from_value::<LotteryState>(value) {
                    Ok(state) => print_state(&state),
                    Err(e) => println!("  State: unreadable ({})", e),
                },
                None => println!("  State: (none cached)"),
            }
        }

        Commands::Cache { action } => {
            let storage = open_cache(&data_dir)?;
            match action {
                CacheAction::List => {
                    let entries = storage.list()?;
                    if entries.is_empty() {
                        println!("Cache is empty.");
                    } else {
                        println!("Cached entries ({}):", entries.len());
                        println!();
                        for (key, entry) in entries {
                            println!(
                                "  {}  {}  {}",
                                key,
                                format_timestamp(entry.written_at),
                                preview(&entry.value)
                            );
                        }
                    }
                }

                CacheAction::Get { path } => match storage.get_collection(&path)? {
                    Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    None => anyhow::bail!("No cached value for '{}'", path),
                },

                CacheAction::Set { path, value } => {
                    let value: Value = serde_json::from_str(&value)
                        .with_context(|| format!("Invalid JSON for '{}'", path))?;
                    storage.put(&path, &value)?;
                    println!("Cached {}", path);
                }

                CacheAction::Remove { path } => {
                    let removed = storage.remove_tree(&path)?;
                    println!("Removed {} entries for {}", removed, path);
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },

        Commands::Demo { outage_ms } => {
            run_demo(config, Duration::from_millis(outage_ms)).await?;
        }
    }

    Ok(())
}

fn print_state(state: &LotteryState) {
    println!("  State: {}", state.status);
    if let Some(prize) = &state.current_prize {
        println!("  Current prize: {} ({})", prize.name, prize.id);
    }
    if let Some(winner) = &state.current_winner {
        println!("  Current winner: {} ({})", winner.name, winner.id);
    }
    println!("  Winners drawn: {}", state.winners.len());
}

/// Stand-in for the big-screen engine: prints what it is asked to do
struct ConsoleEngine;

impl LegacyEngine for ConsoleEngine {
    fn start(&self, prize: Option<&PrizeRef>) {
        match prize {
            Some(prize) => println!("[display] engine: rolling for {}", prize.name),
            None => println!("[display] engine: rolling"),
        }
    }

    fn stop(&self) {
        println!("[display] engine: stopped");
    }

    fn reset(&self) {
        println!("[display] engine: reset");
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

async fn run_demo(config: SyncConfig, outage: Duration) -> Result<()> {
    let config = SyncConfig {
        poll_interval_ms: config.poll_interval_ms.min(50),
        command_poll_interval_ms: config.command_poll_interval_ms.min(50),
        ..config
    };
    let hub = MemoryHub::new();

    let admin = LotteryClient::connect(
        Arc::new(hub.link()),
        Storage::in_memory()?,
        config.clone(),
        ClientRole::Admin,
        None,
    )
    .await?;
    let controller = LotteryClient::connect(
        Arc::new(hub.link()),
        Storage::in_memory()?,
        config.clone(),
        ClientRole::Controller,
        None,
    )
    .await?;
    let display_link = hub.link();
    let display = LotteryClient::connect(
        Arc::new(display_link.clone()),
        Storage::in_memory()?,
        config,
        ClientRole::Display,
        Some(Arc::new(ConsoleEngine)),
    )
    .await?;

    display.on_connection_change(|connected, local| {
        println!("[display] connection: connected={} local_mode={}", connected, local);
    });

    println!("Clients: admin, controller, display");
    println!();

    let prize = PrizeRef::new("p1", "Bicycle");
    admin
        .update_prizes(json!([{"id": "p1", "name": "Bicycle"}, {"id": "p2", "name": "Laptop"}]))
        .await;
    admin
        .update_employees(json!([{"id": "e1", "name": "Ada"}, {"id": "e2", "name": "Grace"}]))
        .await;
    println!("[admin] prizes and employees published");

    admin.reconciler().start_lottery(prize.clone()).await?;
    controller.start_lottery(Some(prize)).await?;
    println!("[controller] start issued");
    settle().await;
    println!("[display] state: {}", display.state().status);

    display_link.set_connected(false);
    settle().await;
    println!("[display] link down");

    admin
        .reconciler()
        .show_winner(WinnerRef::new("e2", "Grace"))
        .await?;
    println!("[admin] winner: Grace");
    println!("[display] state while offline: {}", display.state().status);

    tokio::time::sleep(outage).await;
    display_link.set_connected(true);
    settle().await;
    settle().await;
    println!("[display] state after reconnect: {}", display.state().status);

    controller.stop_lottery().await?;
    settle().await;
    admin.reconciler().complete_prize().await?;
    admin
        .announce_result(json!({"prize": "p1", "winners": ["e2"]}))
        .await;
    settle().await;

    println!();
    println!("Final state (admin):");
    print_state(&admin.state());
    println!("Shared store entries: {}", hub.len());

    display.shutdown();
    controller.shutdown();
    admin.shutdown();
    println!();
    println!("Demo complete");
    Ok(())
}
