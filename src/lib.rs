//! pow-ledger: a proof-of-work account ledger with peer synchronization
//!
//! This crate provides:
//! - Signed account-model transfers with fees (secp256k1)
//! - Blocks committed by a merkle root and sealed by compact-bits proof of work
//! - Periodic difficulty retargeting and a capped coin supply
//! - A fee-ordered mempool that survives reorganizations
//! - Synchronous and resumable mining
//! - Longest-chain synchronization between TCP peers
//! - JSON persistence behind a storage trait
//!
//! # Example
//!
//! ```rust
//! use pow_ledger::core::{Blockchain, ConsensusParams};
//! use pow_ledger::crypto::Secp256k1Verifier;
//! use pow_ledger::mining::{MineResult, Miner, MiningSnapshot};
//! use std::sync::Arc;
//!
//! let mut chain = Blockchain::new(ConsensusParams::regtest(), Arc::new(Secp256k1Verifier::new()));
//!
//! let tip = chain.latest_block();
//! let snapshot = MiningSnapshot {
//!     tip_hash: tip.hash.clone(),
//!     next_index: chain.len(),
//!     bits: chain.next_bits(),
//!     median_time_past: chain.median_time_past(),
//!     supply: chain.supply(),
//!     block_reward: chain.params().block_reward,
//!     max_supply: chain.params().max_supply,
//!     transactions: vec![],
//! };
//!
//! let miner = Miner::new("miner");
//! if let MineResult::Found(block, stats) = miner.mine_synchronous(miner.build_candidate(&snapshot), 1_000_000) {
//!     println!("Mined block {} in {}ms", block.index, stats.time_ms);
//!     chain.append_block(block).unwrap();
//! }
//! assert_eq!(chain.balance("miner"), 50);
//! ```

pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use core::{
    Block, BlockRef, Blockchain, ChainInfo, ConsensusParams, Ledger, LedgerError, Transaction,
};
pub use crypto::{KeyPair, Secp256k1Verifier, SignatureVerifier};
pub use mining::{Mempool, Miner};
pub use network::{Node, NodeConfig};
pub use storage::{ChainStore, JsonFileStore, MemoryStore};
