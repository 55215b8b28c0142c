//! The ledger: the chain, the mempool and the persistence hook behind locks
//!
//! Locks are always taken chain first, then mempool. Mutations of the chain
//! (`append_block`, `replace_chain`) hold the chain write lock for their
//! whole duration, so each one is atomic with respect to every other reader.

use crate::core::block::{Block, BlockError};
use crate::core::blockchain::{Blockchain, BlockchainError, ChainInfo, ConsensusParams};
use crate::core::transaction::Transaction;
use crate::crypto::{is_hex_digest, SignatureVerifier};
use crate::mining::{Mempool, MempoolError, MempoolStats, MiningSnapshot, SubmitOutcome};
use crate::storage::{ChainStore, StorageError};
use chrono::Utc;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Block rejected: {0}")]
    Rejected(#[from] BlockError),
    #[error("Transaction rejected: {0}")]
    Mempool(#[from] MempoolError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Stored chain is invalid: {0}")]
    Replay(#[from] BlockchainError),
}

impl LedgerError {
    /// The block was built on an outdated tip
    pub fn is_stale(&self) -> bool {
        matches!(self, LedgerError::Rejected(e) if e.is_stale())
    }
}

/// Why a candidate chain was not adopted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplaceError {
    #[error("Candidate chain of length {candidate} is not longer than ours ({current})")]
    NoImprovement { current: u64, candidate: u64 },
    #[error("Candidate chain has a different genesis: expected {expected}, found {found}")]
    GenesisMismatch { expected: String, found: String },
    #[error("Candidate block {index} is invalid: {source}")]
    Invalid {
        index: u64,
        #[source]
        source: BlockError,
    },
}

/// What a successful replacement changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub old_length: u64,
    pub new_length: u64,
    /// Blocks of the old chain that were dropped
    pub reorg_depth: u64,
    /// Orphaned transactions returned to the mempool
    pub readmitted: usize,
}

/// A block lookup key: an index or a 64-hex hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Index(u64),
    Hash(String),
}

impl FromStr for BlockRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_hex_digest(s) {
            return Ok(BlockRef::Hash(s.to_lowercase()));
        }
        s.parse::<u64>()
            .map(BlockRef::Index)
            .map_err(|_| format!("'{}' is neither a block index nor a block hash", s))
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Index(index) => write!(f, "{}", index),
            BlockRef::Hash(hash) => write!(f, "{}", hash),
        }
    }
}

/// Lock-guarded owner of the chain and mempool
pub struct Ledger {
    chain: RwLock<Blockchain>,
    mempool: RwLock<Mempool>,
    store: Arc<dyn ChainStore>,
    params: ConsensusParams,
    genesis_hash: String,
}

impl Ledger {
    /// Load the stored chain (fully re-validating it) or start a fresh one
    pub fn open(
        params: ConsensusParams,
        verifier: Arc<dyn SignatureVerifier>,
        store: Arc<dyn ChainStore>,
        mempool_capacity: usize,
    ) -> Result<Self, LedgerError> {
        let chain = match store.load_chain()? {
            Some(blocks) => {
                let chain = Blockchain::from_blocks(blocks, params, verifier)?;
                log::info!(
                    "Loaded chain from storage: {} blocks, tip {}",
                    chain.len(),
                    chain.latest_block().hash
                );
                chain
            }
            None => {
                let chain = Blockchain::new(params, verifier);
                store.save_chain(chain.blocks())?;
                log::info!("Created new chain with genesis {}", chain.genesis().hash);
                chain
            }
        };

        Ok(Self {
            genesis_hash: chain.genesis().hash.clone(),
            chain: RwLock::new(chain),
            mempool: RwLock::new(Mempool::with_capacity(mempool_capacity)),
            store,
            params,
        })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn genesis_hash(&self) -> &str {
        &self.genesis_hash
    }

    fn persist(&self, chain: &Blockchain) {
        if let Err(e) = self.store.save_chain(chain.blocks()) {
            log::error!("Failed to persist chain at length {}: {}", chain.len(), e);
        }
    }

    /// Validate `block` against the tip and append it
    pub async fn append_block(&self, block: Block) -> Result<(), LedgerError> {
        let mut chain = self.chain.write().await;
        let index = block.index;
        let hash = block.hash.clone();
        let tx_ids: Vec<String> = block.transactions.iter().map(|tx| tx.id.clone()).collect();

        chain.append_block(block)?;

        let evicted = {
            let mut mempool = self.mempool.write().await;
            let ctx = chain.transaction_context(Utc::now());
            mempool.reconcile(&tx_ids, chain.balances(), &ctx)
        };

        log::info!(
            "Accepted block {} ({}) with {} transactions",
            index,
            hash,
            tx_ids.len()
        );
        if !evicted.is_empty() {
            log::info!("Evicted {} invalidated transactions from mempool", evicted.len());
        }

        self.persist(&chain);
        Ok(())
    }

    /// Adopt `candidate` if it is a strictly longer valid chain with our
    /// genesis. On any error nothing changes.
    pub async fn replace_chain(&self, candidate: Vec<Block>) -> Result<ReplaceOutcome, ReplaceError> {
        let mut chain = self.chain.write().await;
        let old_length = chain.len();
        let new_length = candidate.len() as u64;

        if new_length <= old_length {
            return Err(ReplaceError::NoImprovement {
                current: old_length,
                candidate: new_length,
            });
        }

        let plan = chain.plan_replacement(candidate).map_err(|e| match e {
            BlockchainError::InvalidBlock { index, source } => ReplaceError::Invalid { index, source },
            BlockchainError::GenesisMismatch { expected, found } => {
                ReplaceError::GenesisMismatch { expected, found }
            }
            BlockchainError::EmptyChain => ReplaceError::NoImprovement {
                current: old_length,
                candidate: 0,
            },
        })?;

        let orphaned = Blockchain::transfers_of(&plan.orphaned);
        let reorg_depth = plan.orphaned.len() as u64;
        *chain = plan.chain;

        let readmitted = {
            let mut mempool = self.mempool.write().await;
            let ctx = chain.transaction_context(Utc::now());
            mempool.reconcile(&[], chain.balances(), &ctx);
            mempool.readmit(orphaned, chain.balances(), &ctx)
        };

        log::info!(
            "Replaced chain: length {} -> {}, fork at {}, {} blocks orphaned, {} transactions readmitted",
            old_length,
            new_length,
            plan.fork_index,
            reorg_depth,
            readmitted
        );

        self.persist(&chain);
        Ok(ReplaceOutcome {
            old_length,
            new_length,
            reorg_depth,
            readmitted,
        })
    }

    /// Validate a transaction and add it to the mempool
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<SubmitOutcome, LedgerError> {
        let chain = self.chain.read().await;
        let mut mempool = self.mempool.write().await;
        let ctx = chain.transaction_context(Utc::now());
        Ok(mempool.submit(tx, chain.balances(), &ctx)?)
    }

    /// Everything a miner needs, taken atomically
    pub async fn mining_snapshot(&self, max_transactions: usize) -> MiningSnapshot {
        let chain = self.chain.read().await;
        let mempool = self.mempool.read().await;
        let tip = chain.latest_block();

        // One slot is reserved for the reward
        let room = chain.params().max_block_transactions.saturating_sub(1);

        MiningSnapshot {
            tip_hash: tip.hash.clone(),
            next_index: tip.index + 1,
            bits: chain.next_bits(),
            median_time_past: chain.median_time_past(),
            supply: chain.supply(),
            block_reward: chain.params().block_reward,
            max_supply: chain.params().max_supply,
            transactions: mempool.select_for_block(max_transactions.min(room)),
        }
    }

    /// Issued coins, recounted from the blocks
    pub async fn current_supply(&self) -> Result<u64, BlockError> {
        self.chain.read().await.current_supply()
    }

    pub async fn chain_info(&self) -> ChainInfo {
        self.chain.read().await.stats()
    }

    pub async fn chain_length(&self) -> u64 {
        self.chain.read().await.len()
    }

    /// Chain length and tip hash, read together
    pub async fn tip(&self) -> (u64, String) {
        let chain = self.chain.read().await;
        (chain.len(), chain.latest_block().hash.clone())
    }

    pub async fn tip_hash(&self) -> String {
        self.chain.read().await.latest_block().hash.clone()
    }

    pub async fn block(&self, reference: &BlockRef) -> Option<Block> {
        let chain = self.chain.read().await;
        match reference {
            BlockRef::Index(index) => chain.get_block(*index).cloned(),
            BlockRef::Hash(hash) => chain.get_block_by_hash(hash).cloned(),
        }
    }

    pub async fn blocks(&self) -> Vec<Block> {
        self.chain.read().await.blocks().to_vec()
    }

    pub async fn blocks_from(&self, index: u64) -> Vec<Block> {
        self.chain.read().await.blocks_from(index).to_vec()
    }

    pub async fn balance(&self, address: &str) -> u64 {
        self.chain.read().await.balance(address)
    }

    pub async fn mempool_transactions(&self) -> Vec<Transaction> {
        self.mempool.read().await.transactions()
    }

    pub async fn mempool_stats(&self) -> MempoolStats {
        self.mempool.read().await.stats()
    }

    /// Whether `id` is pending or confirmed
    pub async fn knows_transaction(&self, id: &str) -> bool {
        let chain = self.chain.read().await;
        let mempool = self.mempool.read().await;
        chain.contains_tx(id) || mempool.contains(id)
    }
}
