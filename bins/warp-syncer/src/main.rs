//! Warp syncer binary.
//!
//! Loads the layered configuration, opens RocksDB storage and runs the
//! supervised ingestion pipeline until interrupted.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use warp_sync::{RocksStore, Store, Syncer, SyncerConfig};

#[derive(Parser, Debug)]
#[command(name = "warp-syncer", version, about = "Resumable, validated ledger ingestion")]
struct Cli {
    /// TOML configuration file. `WARP_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the `syncdata` database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline until Ctrl+C or SIGTERM.
    Run(RunArgs),
    /// Print the persisted checkpoint of a component as JSON.
    Checkpoint {
        /// Component name; defaults to the configured one
        #[arg(long)]
        component: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source-of-truth peer
    #[arg(long)]
    primary: Option<String>,

    /// Failover peers (comma-separated), replacing the configured list
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// First height to fetch when no checkpoint exists
    #[arg(long)]
    start_height: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl RunArgs {
    fn apply(self, config: &mut SyncerConfig) -> String {
        if let Some(primary) = self.primary {
            config.client.primary = primary;
        }
        if !self.peers.is_empty() {
            config.client.peers = self.peers;
        }
        if let Some(height) = self.start_height {
            config.start_height = height;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        self.log_format
    }
}

fn load_config(cli: &Cli) -> Result<SyncerConfig> {
    let mut config = SyncerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    };

    let outcome = match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Checkpoint { component } => print_checkpoint(&config, component),
    };
    if let Err(e) = outcome {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(mut config: SyncerConfig, args: RunArgs) -> Result<()> {
    let log_format = args.apply(&mut config);
    config.validate().context("invalid configuration")?;
    init_logging(&config.log_level, &log_format);

    info!("Warp syncer v{}", env!("CARGO_PKG_VERSION"));
    info!(component = %config.component, primary = %config.client.primary, peers = config.client.peers.len(), "configuration loaded");
    info!(data_dir = ?config.data_dir, "opening storage");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data_dir {}", config.data_dir.display()))?;
    let store = Arc::new(RocksStore::open(config.db_path()).context("failed to open database")?);

    match store.last_checkpoint(&config.component)? {
        Some(cp) => info!(height = cp.height, hash = %cp.hash, "resuming from checkpoint"),
        None => info!(start_height = config.start_height, "no checkpoint, starting fresh"),
    }

    let stop_timeout = config.watchdog.stop_timeout;
    let syncer = Syncer::from_config(config, store.clone());
    syncer.task().start().context("failed to start pipeline")?;
    info!("syncer running (Ctrl+C to stop)");

    tokio::select! {
        res = syncer.task().wait() => {
            if let Err(e) = res {
                warn!(error = %e, "pipeline terminated on its own");
            }
        }
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    let stopped = syncer.task().stop_wait().await;
    let stats = syncer.stats().snapshot();
    info!(restarts = syncer.restarts(), stats = %serde_json::to_string(&stats)?, "final counters");
    store.flush().context("failed to flush database")?;
    stopped.with_context(|| format!("pipeline did not stop within {stop_timeout:?}"))?;
    info!("warp syncer shutdown complete");
    Ok(())
}

fn print_checkpoint(config: &SyncerConfig, component: Option<String>) -> Result<()> {
    let component = component.unwrap_or_else(|| config.component.clone());
    let store = RocksStore::open(config.db_path()).context("failed to open database")?;
    let checkpoint = store.last_checkpoint(&component)?;
    let out = serde_json::json!({
        "component": component,
        "checkpoint": checkpoint,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Resolves on Ctrl+C, or on SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize tracing with the given level and output format.
///
/// `RUST_LOG`, when set, takes precedence over `level_str`.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
