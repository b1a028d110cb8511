//! Trade agent — reference wiring for the trade execution core
//!
//! Wires the engine's backend traits to the in-memory wallet, the in-process
//! messenger and the file trade store, resumes pending trades at startup,
//! and can drive a complete two-party trade locally.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use trade_engine::config::EngineConfig;
use trade_engine::dispatch::resume_pending;
use trade_engine::logging::init_logging;
use trade_engine::registry::TradeRegistry;
use trade_engine::runner::TaskDeps;
use trade_engine::store::{FileTradeStore, TradeStore};

mod backend;
mod messenger;
mod simulate;

use backend::{InMemoryWallet, MockChain};
use messenger::{ChannelMessenger, InProcessNetwork};

#[derive(Parser)]
#[command(name = "trade-agent")]
#[command(about = "P2P trade execution agent — escrow deposits and mediated payouts")]
struct Cli {
    /// Path to protocol configuration file
    #[arg(short, long, default_value = "trade.toml")]
    config: std::path::PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local two-party trade end to end through the reference backends
    Simulate {
        /// Also run a scripted dispute and mediated payout after the deposit
        #[arg(long)]
        mediation: bool,
    },
    /// Reload pending trades from the data dir and continue their sequences
    Resume,
    /// Query information
    Info {
        #[command(subcommand)]
        command: InfoCommands,
    },
    /// Key management
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
}

#[derive(Subcommand)]
enum InfoCommands {
    /// Show a pending trade's state
    Trade { trade_id: String },
}

#[derive(Subcommand)]
enum KeysCommands {
    /// Generate a new Ed25519 node keypair (base58)
    Generate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate { mediation } => simulate::run_simulation(mediation).await,
        Commands::Resume => resume(&cli.config).await,
        Commands::Info { command: InfoCommands::Trade { trade_id } } => {
            show_trade(&cli.config, &trade_id)
        }
        Commands::Keys { command: KeysCommands::Generate } => {
            generate_keys();
            Ok(())
        }
    }
}

/// Build deps against the reference backends and continue pending trades.
///
/// Without a live transport, re-sends fall into recoverable failure paths
/// and stay retryable — the trades themselves are never corrupted by this.
async fn resume(config_path: &std::path::Path) -> Result<()> {
    let config = EngineConfig::load(config_path)?;
    let store = Arc::new(
        FileTradeStore::new(&config.data_dir).context("Failed to open trade store")?,
    );

    let chain = MockChain::new();
    let wallet = InMemoryWallet::new("agent", config.private_key_bytes, chain);
    let network = InProcessNetwork::new();
    let messenger = ChannelMessenger::new(network, config.private_key_bytes);

    let deps = TaskDeps {
        wallet,
        messenger,
        store: store.clone(),
        config: config.clone(),
    };

    let mut registry = TradeRegistry::new(config.seen_message_cap);
    let reports = resume_pending(&mut registry, &deps).await?;

    if registry.is_empty() {
        info!("No pending trades");
        return Ok(());
    }

    for report in &reports {
        match &report.failure {
            None => info!(
                "[{}] Resumed sequence completed ({} task(s))",
                report.trade_id,
                report.completed.len()
            ),
            Some(failure) => warn!(
                "[{}] Resumed sequence stopped at {}: {}",
                report.trade_id, failure.task, failure.reason
            ),
        }
    }
    for trade in registry.iter() {
        info!(
            "[{}] {} — phase {}, step {}, dispute {}",
            trade.id, trade.role, trade.phase, trade.step, trade.dispute_state
        );
    }
    Ok(())
}

fn show_trade(config_path: &std::path::Path, trade_id: &str) -> Result<()> {
    let config = EngineConfig::load(config_path)?;
    let store = FileTradeStore::new(&config.data_dir)?;
    let pending = store.load_pending()?;

    let Some(trade) = pending.iter().find(|t| t.id == trade_id) else {
        println!("Trade {} not found among pending trades", trade_id);
        return Ok(());
    };

    println!("Trade {}", trade.id);
    println!("  role:             {}", trade.role);
    println!("  phase:            {}", trade.phase);
    println!("  step:             {}", trade.step);
    println!("  dispute:          {}", trade.dispute_state);
    println!("  mediation result: {}", trade.mediation_result_state);
    println!("  amount:           {}", trade.contract.trade_amount);
    println!("  total escrow:     {}", trade.total_escrow());
    println!(
        "  deposit txid:     {}",
        trade.deposit_txid.as_deref().unwrap_or("-")
    );
    println!(
        "  payout txid:      {}",
        trade.payout_txid.as_deref().unwrap_or("-")
    );
    if !trade.error_log.is_empty() {
        println!("  error log:");
        for entry in &trade.error_log {
            println!("    {} {}", entry.at.format("%Y-%m-%d %H:%M:%S"), entry.message);
        }
    }
    Ok(())
}

/// Print a fresh Ed25519 keypair: 64-byte base58 private (seed + public),
/// base58 and hex public.
fn generate_keys() {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    let mut keypair_bytes = [0u8; 64];
    keypair_bytes[..32].copy_from_slice(signing_key.as_bytes());
    keypair_bytes[32..].copy_from_slice(verifying_key.as_bytes());

    println!("private (base58): {}", bs58::encode(keypair_bytes).into_string());
    println!("public  (base58): {}", bs58::encode(verifying_key.as_bytes()).into_string());
    println!("public  (hex):    {}", hex::encode(verifying_key.as_bytes()));
}
