//! stakechaind
//!
//! Single-node driver for a stakechain data directory.
//!
//! ```bash
//! stakechaind init --data-dir ./node
//! stakechaind status --data-dir ./node
//! stakechaind run --data-dir ./node --interval 10
//! stakechaind export --data-dir ./node --out state.json
//! ```

use clap::{Args, Parser, Subcommand};
use stakechain::chain::{ChainConfig, ChainManager, StateSnapshot};
use stakechain::clock::{Clock, SystemClock};
use stakechain::consensus::{BlockVote, VoteOutcome};
use stakechain::identity::{Ed25519Verifier, Keypair, SigningService};
use stakechain::storage::{ChainStore, SledStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";
const DB_DIR: &str = "db";

/// Permissioned proof-of-stake node
#[derive(Parser)]
#[command(name = "stakechaind", version, about = "stakechain single-node driver", long_about = None)]
struct Cli {
    /// Data directory holding config, state and the block archive
    #[arg(short, long, global = true, env = "STAKECHAIN_DATA_DIR", default_value = "./stakechain-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a node key and a fresh chain with this node as genesis validator
    Init(InitArgs),
    /// Print the chain status as JSON
    Status,
    /// Write a snapshot of the full state
    Export(ExportArgs),
    /// Replace the local state with a verified snapshot
    Import(ImportArgs),
    /// Propose and self-finalize blocks on a timer
    Run(RunArgs),
}

#[derive(Args)]
struct InitArgs {
    /// Genesis timestamp, Unix seconds. Defaults to now.
    #[arg(long)]
    genesis_timestamp: Option<u64>,

    /// Overwrite an existing data directory
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    /// Seconds between proposal attempts
    #[arg(long, default_value = "10")]
    interval: u64,

    /// Stop after this many blocks
    #[arg(long)]
    blocks: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Init(args) => init(&cli.data_dir, args),
        Commands::Status => status(&cli.data_dir),
        Commands::Export(args) => export(&cli.data_dir, args),
        Commands::Import(args) => import(&cli.data_dir, args),
        Commands::Run(args) => run(&cli.data_dir, args).await,
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn open_store(data_dir: &Path) -> CliResult<(SledStore, Keypair)> {
    let store = SledStore::open(data_dir.join(DB_DIR))?;
    let keypair = ChainStore::new(store.clone()).get_or_create_keypair()?;
    Ok((store, keypair))
}

/// Load the chain from the state file and the block archive
fn open_chain(data_dir: &Path) -> CliResult<(ChainManager<SledStore>, Keypair)> {
    let state_path = data_dir.join(STATE_FILE);
    if !state_path.exists() {
        return Err(format!("{} is not initialized, run `init` first", data_dir.display()).into());
    }
    let snapshot = StateSnapshot::load(&state_path)?;
    let (store, keypair) = open_store(data_dir)?;
    let chain = ChainManager::from_snapshot(snapshot, store, Arc::new(Ed25519Verifier), Arc::new(SystemClock))?;
    Ok((chain, keypair))
}

fn save_state(chain: &ChainManager<SledStore>, data_dir: &Path) -> CliResult<()> {
    chain.export_state().save(data_dir.join(STATE_FILE))?;
    chain.store().flush()?;
    Ok(())
}

fn init(data_dir: &Path, args: InitArgs) -> CliResult<()> {
    if data_dir.join(CONFIG_FILE).exists() && !args.force {
        return Err(format!("{} is already initialized", data_dir.display()).into());
    }
    std::fs::create_dir_all(data_dir)?;

    let (store, keypair) = open_store(data_dir)?;
    let timestamp = args.genesis_timestamp.unwrap_or_else(|| SystemClock.now());
    let config = ChainConfig::new(keypair.address()).with_genesis_timestamp(timestamp);
    config.save(data_dir.join(CONFIG_FILE))?;

    let chain = ChainManager::new(config, store, Arc::new(Ed25519Verifier), Arc::new(SystemClock))?;
    save_state(&chain, data_dir)?;
    info!(address = %keypair.address(), genesis = %chain.tip_hash(), "node initialized");
    Ok(())
}

fn status(data_dir: &Path) -> CliResult<()> {
    let (chain, keypair) = open_chain(data_dir)?;
    println!("{}", serde_json::to_string_pretty(&chain.status())?);
    println!("node address: {}", keypair.address());
    Ok(())
}

fn export(data_dir: &Path, args: ExportArgs) -> CliResult<()> {
    let (chain, _) = open_chain(data_dir)?;
    chain.export_state().save(&args.out)?;
    info!(path = %args.out.display(), height = chain.height(), "state exported");
    Ok(())
}

fn import(data_dir: &Path, args: ImportArgs) -> CliResult<()> {
    let snapshot = StateSnapshot::load(&args.file)?;
    std::fs::create_dir_all(data_dir)?;
    let (store, _) = open_store(data_dir)?;
    let chain = ChainManager::from_snapshot(snapshot, store, Arc::new(Ed25519Verifier), Arc::new(SystemClock))?;
    chain.config().save(data_dir.join(CONFIG_FILE))?;
    save_state(&chain, data_dir)?;
    info!(height = chain.height(), "state imported");
    Ok(())
}

async fn run(data_dir: &Path, args: RunArgs) -> CliResult<()> {
    let (chain, keypair) = open_chain(data_dir)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let mut produced = 0u64;
    info!(address = %keypair.address(), height = chain.height(), "node running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick(&chain, &keypair) {
                    warn!(error = %e, "slot failed");
                    continue;
                }
                produced += 1;
                save_state(&chain, data_dir)?;
                if args.blocks.is_some_and(|limit| produced >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    save_state(&chain, data_dir)?;
    Ok(())
}

/// One slot: propose and vote if this node is selected, then housekeeping
fn tick(chain: &ChainManager<SledStore>, keypair: &Keypair) -> CliResult<()> {
    let proposed = chain.propose_block(keypair)?;
    if let Some(block) = &proposed {
        let vote = BlockVote::new(keypair, block.hash, block.height, SystemClock.now());
        if let VoteOutcome::Finalized { height, .. } = chain.submit_vote(vote)? {
            info!(height, "block finalized by local vote");
        }
    }

    let expired = chain.expire();
    if !expired.transactions.is_empty() {
        info!(count = expired.transactions.len(), "expired pending transactions");
    }
    for event in chain.check_inactivity()? {
        warn!(validator = %event.validator, penalty = %event.penalty, "validator penalized for inactivity");
    }

    if proposed.is_none() {
        return Err("not selected for this slot".into());
    }
    Ok(())
}
