//! pow-ledger CLI
//!
//! Runs a node, inspects stored chains, and generates keys for local testing.

use clap::{Parser, Subcommand};
use pow_ledger::core::{Blockchain, ConsensusParams};
use pow_ledger::crypto::{KeyPair, Secp256k1Verifier};
use pow_ledger::network::{MineStep, Node, NodeConfig};
use pow_ledger::storage::{ChainStore, JsonFileStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pow-ledger")]
#[command(version)]
#[command(about = "A proof-of-work ledger node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Start {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on (host:port)
        #[arg(short, long)]
        listen: Option<String>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long)]
        peers: Option<String>,

        /// Data directory for chain storage
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Mine continuously, paying rewards to this address
        #[arg(long)]
        mine: Option<String>,

        /// Nonces tried per mining step
        #[arg(long, default_value = "100000")]
        attempts: u64,

        /// Use trivial proof of work
        #[arg(long)]
        regtest: bool,
    },

    /// Show information about the stored chain
    Info {
        #[arg(short, long, default_value = ".ledger_data")]
        data_dir: PathBuf,

        #[arg(long)]
        regtest: bool,
    },

    /// Re-validate the stored chain
    Validate {
        #[arg(short, long, default_value = ".ledger_data")]
        data_dir: PathBuf,

        #[arg(long)]
        regtest: bool,
    },

    /// Generate a key pair
    Keygen,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            listen,
            peers,
            data_dir,
            mine,
            attempts,
            regtest,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::from_toml_file(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(listen) = listen {
                node_config.listen_addr = listen;
            }
            if let Some(peers) = peers {
                node_config.bootstrap_peers = peers
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(data_dir) = data_dir {
                node_config.data_dir = data_dir;
            }
            if regtest {
                node_config.consensus = ConsensusParams::regtest();
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(node_config, mine, attempts))?;
        }

        Commands::Info { data_dir, regtest } => {
            let chain = load_chain(&data_dir, regtest)?;
            let info = chain.stats();
            println!("⛓️  Chain at {}", data_dir.display());
            println!("   Length:       {}", info.length);
            println!("   Tip:          {}", info.tip_hash);
            println!("   Tip time:     {}", info.tip_timestamp);
            println!("   Next bits:    {:#010x}", info.bits);
            println!("   Supply:       {}", info.supply);
            println!("   Chain work:   {}", info.chain_work);
            println!("   Transactions: {}", info.total_transactions);
            println!("   Accounts:     {}", info.accounts);
        }

        Commands::Validate { data_dir, regtest } => {
            let chain = load_chain(&data_dir, regtest)?;
            println!("✅ Chain is valid ({} blocks)", chain.len());
        }

        Commands::Keygen => {
            let key_pair = KeyPair::generate();
            println!("🔑 Address:     {}", key_pair.public_key_hex());
            println!("   Private key: {}", key_pair.private_key_hex());
        }
    }

    Ok(())
}

fn consensus_for(regtest: bool) -> ConsensusParams {
    if regtest {
        ConsensusParams::regtest()
    } else {
        ConsensusParams::default()
    }
}

/// Load and fully re-validate the stored chain
fn load_chain(data_dir: &Path, regtest: bool) -> Result<Blockchain, Box<dyn std::error::Error>> {
    let store = JsonFileStore::in_dir(data_dir)?;
    let blocks = store
        .load_chain()?
        .ok_or_else(|| format!("no chain stored in {}", data_dir.display()))?;
    let chain = Blockchain::from_blocks(
        blocks,
        consensus_for(regtest),
        Arc::new(Secp256k1Verifier::new()),
    )?;
    Ok(chain)
}

async fn run_node(
    config: NodeConfig,
    mine: Option<String>,
    attempts: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(JsonFileStore::in_dir(&config.data_dir)?);
    let node = Node::launch(config, store).await?;
    println!("🌐 Node listening on {}", node.listen_addr());

    match mine {
        Some(address) => {
            println!("⛏️  Mining to {}", address);
            tokio::select! {
                result = mine_forever(&node, &address, attempts) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    println!("\n📴 Shutting down node...");
    node.shutdown();
    Ok(())
}

async fn mine_forever(node: &Node, address: &str, attempts: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut resume = None;
    loop {
        match node.mine_step(attempts, address, resume.take()).await? {
            MineStep::Found(block) => {
                println!("✨ Mined block {} ({})", block.index, block.hash);
            }
            MineStep::Continue(state) => resume = Some(state),
            MineStep::Stale => log::info!("Mined block went stale, restarting on the new tip"),
        }
    }
}
