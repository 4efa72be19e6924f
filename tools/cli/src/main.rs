//! VaultSync CLI - keeps local directories in step with an encrypted store.
//!
//! Reads a JSON configuration naming the store and the sync pairs, then
//! runs the pairs continuously, once, or only reports what they would do.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vaultsync_storage::{CloudStore, STORE_KINDS};
use vaultsync_sync::{
    LocalWatcher, PairConfig, StateStore, SyncConfig, SyncLoop, SyncPair, STATE_VERSION,
};

#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "VaultSync - Local folder to encrypted cloud synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/vaultsync/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch and sync all pairs until interrupted.
    Run {
        /// Only run this pair.
        #[arg(short, long)]
        pair: Option<String>,
    },

    /// Run a single cycle for each pair and exit.
    Once {
        /// Only run this pair, even if it is paused.
        #[arg(short, long)]
        pair: Option<String>,
    },

    /// Show the operations the next cycle would perform.
    Plan {
        /// Only plan this pair.
        #[arg(short, long)]
        pair: Option<String>,
    },

    /// Show persisted state of each pair.
    Status,

    /// List the available store types.
    Stores,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Stores = cli.command {
        return cmd_stores();
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = SyncConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Run { pair } => cmd_run(&config, pair.as_deref()).await,
        Commands::Once { pair } => cmd_once(&config, pair.as_deref()).await,
        Commands::Plan { pair } => cmd_plan(&config, pair.as_deref()).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Stores => cmd_stores(),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Cannot determine the user config directory")?;
    Ok(dir.join("vaultsync").join("config.json"))
}

fn open_store(config: &SyncConfig) -> Result<Arc<dyn CloudStore>> {
    config
        .store
        .open()
        .with_context(|| format!("Failed to open '{}' store", config.store.kind))
}

/// Pairs named by `only`, or every pair when `only` is `None`.
///
/// Paused pairs are skipped unless `keep_paused` is set or the pair was
/// asked for by id.
fn select_pairs<'a>(
    config: &'a SyncConfig,
    only: Option<&str>,
    keep_paused: bool,
) -> Result<Vec<&'a PairConfig>> {
    match only {
        Some(id) => {
            let pair = config
                .pair(id)
                .with_context(|| format!("No pair named '{}' in the config", id))?;
            Ok(vec![pair])
        }
        None => Ok(config
            .pairs
            .iter()
            .filter(|pair| keep_paused || !pair.paused)
            .collect()),
    }
}

async fn open_pair(
    config: &SyncConfig,
    pair: &PairConfig,
    store: Arc<dyn CloudStore>,
) -> Result<SyncPair> {
    SyncPair::open(config, pair, store)
        .await
        .with_context(|| format!("Failed to open pair '{}'", pair.id))
}

/// Run loops for the selected pairs until Ctrl-C.
async fn cmd_run(config: &SyncConfig, only: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let pairs = select_pairs(config, only, true)?;
    if pairs.is_empty() {
        anyhow::bail!("No pairs configured");
    }

    let mut watchers = Vec::new();
    let mut handles = Vec::new();
    for pair_config in pairs {
        let pair = Arc::new(open_pair(config, pair_config, store.clone()).await?);
        match LocalWatcher::start(pair.local_root(), pair.signal()) {
            Ok(watcher) => watchers.push(watcher),
            Err(e) => warn!(
                pair = %pair.id(),
                "Watching unavailable, relying on the interval: {}", e
            ),
        }
        info!(
            pair = %pair.id(),
            mode = ?pair.mode(),
            "Starting {} -> {}",
            pair_config.local_path.display(),
            pair_config.remote_path
        );
        handles.push(SyncLoop::spawn(pair, config.debounce(), config.interval()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down, waiting for running cycles");

    for handle in handles {
        handle.stop().await;
    }
    drop(watchers);
    Ok(())
}

/// One cycle per selected pair.
async fn cmd_once(config: &SyncConfig, only: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let mut failed = 0;

    for pair_config in select_pairs(config, only, false)? {
        let pair = open_pair(config, pair_config, store.clone()).await?;
        let report = pair
            .run_cycle(true)
            .await
            .with_context(|| format!("Cycle failed for pair '{}'", pair_config.id))?;

        println!(
            "{}: {} done, {} failed, {} skipped by mode ({:?})",
            pair_config.id,
            report.done,
            report.failures.len(),
            report.skipped,
            report.duration
        );
        for failure in &report.failures {
            println!("  ! {}: {}", failure.delta, failure.message);
        }
        for clash in &report.clashes {
            println!(
                "  ? {} is a {} locally and a {} remotely, left alone",
                clash.path, clash.local, clash.remote
            );
        }
        if !report.persisted {
            println!("  ! state was not saved");
        }
        failed += report.failures.len();
    }

    if failed > 0 {
        anyhow::bail!("{} operations failed", failed);
    }
    Ok(())
}

async fn cmd_plan(config: &SyncConfig, only: Option<&str>) -> Result<()> {
    let store = open_store(config)?;

    for pair_config in select_pairs(config, only, true)? {
        let pair = open_pair(config, pair_config, store.clone()).await?;
        let deltas = pair
            .plan(true)
            .await
            .with_context(|| format!("Planning failed for pair '{}'", pair_config.id))?;

        if deltas.is_empty() {
            println!("{}: up to date", pair_config.id);
            continue;
        }
        println!("{}: {} operations", pair_config.id, deltas.len());
        for delta in deltas {
            println!("  {}", delta);
        }
    }
    Ok(())
}

/// Reads persisted state only; neither side is touched.
async fn cmd_status(config: &SyncConfig) -> Result<()> {
    println!("State: {} (v{})", state_root(&config.db_path).display(), STATE_VERSION);
    for pair in &config.pairs {
        let state = StateStore::new(&config.db_path, &pair.id).load().await;
        println!(
            "{}{}: {} <-> {} ({:?})",
            pair.id,
            if pair.paused { " [paused]" } else { "" },
            pair.local_path.display(),
            pair.remote_path,
            pair.mode
        );
        println!(
            "  {} local items, {} remote items, {} hashes",
            state.local.len(),
            state.remote.len(),
            state.hashes.len()
        );
    }
    Ok(())
}

fn state_root(db_path: &Path) -> PathBuf {
    db_path.join("state")
}

fn cmd_stores() -> Result<()> {
    for kind in STORE_KINDS {
        println!("{:<8} {}", kind.name, kind.summary);
    }
    Ok(())
}
