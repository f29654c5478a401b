//! tally: operator CLI for the block index.
//!
//! Scans a ledger into the local index and queries the result: status
//! counts, address balances and unspent outputs.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use tally_core::address::Address;
use tally_core::constants::{Network, COIN};
use tally_index::config::IndexerConfig;
use tally_index::indexer::Indexer;
use tally_index::orchestrator::ScanOutcome;
use tally_index::storage::IndexStore;

/// Environment variable prefix for configuration overrides. Top-level keys
/// follow a single underscore (`TALLY_RPC_URL`); nested keys are joined with
/// a double one (`TALLY_SCAN__WORKERS`).
const ENV_PREFIX: &str = "TALLY";

/// Crash-safe UTXO and address-balance index.
#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Crash-safe UTXO and address-balance index")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Network whose address encoding to use (main or test)
    #[arg(long, global = true)]
    network: Option<Network>,

    /// Data directory holding the index
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ledger JSON-RPC endpoint
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Ledger RPC username
    #[arg(long, global = true)]
    rpc_user: Option<String>,

    /// Ledger RPC password
    #[arg(long, global = true)]
    rpc_password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index blocks up to the chain tip or a given height.
    Scan {
        /// Stop at this height instead of the current chain tip
        #[arg(long)]
        target_height: Option<u64>,
    },
    /// Show height status counts and the confirmed tip.
    Status,
    /// List address balances, largest first.
    Balances {
        /// Only addresses holding at least this many satoshis
        #[arg(long, default_value_t = 1)]
        min: u64,
        /// Show at most this many rows
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the balance and unspent outputs of one address.
    Address {
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    init_logging(&config.log_level, &cli.global.log_format);

    match cli.command {
        Commands::Scan { target_height } => scan(config, target_height).await,
        Commands::Status => status(&config),
        Commands::Balances { min, limit } => balances(&config, min, limit),
        Commands::Address { address } => show_address(&config, &address),
    }
}

/// Defaults, then the config file, then `TALLY_*` variables, then flags.
fn load_config(args: &GlobalArgs) -> Result<IndexerConfig> {
    resolve_config(args, None)
}

/// [`load_config`] with the environment taken from `env` instead of the
/// process when given.
fn resolve_config(args: &GlobalArgs, env: Option<config::Map<String, String>>) -> Result<IndexerConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    let mut cfg: IndexerConfig = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")?;

    if let Some(network) = args.network {
        cfg.network = network;
    }
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = Some(dir.clone());
    }
    if let Some(url) = &args.rpc_url {
        cfg.rpc_url = url.clone();
    }
    if let Some(user) = &args.rpc_user {
        cfg.rpc_user = Some(user.clone());
    }
    if let Some(password) = &args.rpc_password {
        cfg.rpc_password = Some(password.clone());
    }
    if let Some(level) = &args.log_level {
        cfg.log_level = level.clone();
    }
    Ok(cfg)
}

async fn scan(config: IndexerConfig, target_height: Option<u64>) -> Result<()> {
    info!("tally v{}", env!("CARGO_PKG_VERSION"));
    info!(network = %config.network, rpc_url = %config.rpc_url, data_dir = %config.data_dir().display(), "starting scan");

    let indexer = Indexer::open(config).context("Failed to open index")?;
    let tip = indexer
        .ledger_tip()
        .await
        .context("Failed to fetch chain tip from ledger")?;
    let target = target_height.map_or(tip.height, |h| h.min(tip.height));
    info!(chain_tip = tip.height, best_hash = %tip.best_hash, target, "chain tip resolved");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, stopping after the current batch");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "failed to install Ctrl+C handler"),
        }
    });

    let report = indexer.scan(target, shutdown_rx).await.context("Scan aborted")?;
    let confirmed = report.confirmed_tip;
    let remaining = match confirmed {
        Some(tip) => target.saturating_sub(tip),
        None => target.saturating_add(1),
    };
    match report.outcome {
        ScanOutcome::Completed => info!(confirmed_tip = ?confirmed, "scan complete"),
        ScanOutcome::Cancelled => info!(confirmed_tip = ?confirmed, remaining, "scan cancelled"),
        ScanOutcome::Stalled => warn!(
            confirmed_tip = ?confirmed,
            remaining,
            "scan stalled; failed heights need attention"
        ),
    }
    info!(
        applied = report.applied,
        already_done = report.already_done,
        failed_attempts = report.failed_attempts,
        "scan summary"
    );
    Ok(())
}

fn status(config: &IndexerConfig) -> Result<()> {
    let store = open_existing(config)?;
    let counts = store.status_counts().context("Failed to read status counts")?;
    let tip = store.confirmed_tip().context("Failed to read confirmed tip")?;

    println!("Network:       {}", config.network);
    match tip {
        Some(tip) => println!("Confirmed tip: {tip}"),
        None => println!("Confirmed tip: none"),
    }
    println!("Processed:     {}", counts.processed);
    println!("Pending:       {}", counts.pending);
    println!("Failed:        {}", counts.failed);
    println!("Early spends:  {}", store.early_spend_count().context("Failed to count early spends")?);
    Ok(())
}

fn balances(config: &IndexerConfig, min: u64, limit: Option<usize>) -> Result<()> {
    let store = open_existing(config)?;
    let (rows, matched) = match limit {
        Some(limit) => store.top_balances(min, limit),
        None => store.balances(min).map(|rows| {
            let matched = rows.len() as u64;
            (rows, matched)
        }),
    }
    .context("Failed to read balances")?;

    for (address, value) in &rows {
        println!("{address:<64} {:>20}", format_coins(*value));
    }
    let hidden = matched.saturating_sub(rows.len() as u64);
    if hidden > 0 {
        println!("... {hidden} more");
    }
    Ok(())
}

fn show_address(config: &IndexerConfig, text: &str) -> Result<()> {
    let parsed = Address::parse(text, &config.network.params())
        .with_context(|| format!("Invalid {} address: {text}", config.network))?;
    let store = open_existing(config)?;
    let balance = store.balance(parsed.as_str()).context("Failed to read balance")?;
    let utxos = store
        .utxos_for_address(parsed.as_str())
        .context("Failed to read unspent outputs")?;

    println!("Address: {parsed}");
    println!("Kind:    {:?}", parsed.kind());
    println!("Balance: {}", format_coins(balance));
    println!("UTXOs:   {}", utxos.len());
    for utxo in &utxos {
        println!("  {}  {}", utxo.outpoint, format_coins(utxo.value));
    }
    Ok(())
}

/// Open the index read side; refuses to create a fresh one.
fn open_existing(config: &IndexerConfig) -> Result<IndexStore> {
    let path = config.db_path();
    if !path.is_dir() {
        bail!("No index at {} (run `tally scan` first)", path.display());
    }
    IndexStore::open(&path, config.lock_timeout())
        .with_context(|| format!("Failed to open index at {}", path.display()))
}

/// Satoshis as a fixed-point coin amount.
fn format_coins(sats: u64) -> String {
    format!("{}.{:08}", sats / COIN, sats % COIN)
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` takes precedence over `level`. Pass `format = "json"` for
/// structured JSON output; any other value gives human-readable text.
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

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
