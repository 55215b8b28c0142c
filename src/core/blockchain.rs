//! Blockchain implementation
//!
//! The chain of accepted blocks together with the state derived from it:
//! balances, issued supply, confirmed transaction ids and the difficulty
//! schedule. `Blockchain` is not synchronized; [`crate::core::Ledger`] owns it
//! behind a lock.

use crate::core::balance::{BalanceOverlay, BalanceSource, BalanceView};
use crate::core::block::{Block, BlockError, MAX_BLOCK_TXS};
use crate::core::difficulty::{block_work, expand_compact, DifficultyState, DEFAULT_BITS, REGTEST_BITS};
use crate::core::transaction::Transaction;
use crate::core::validation::{validate_block, BlockEffects, ChainContext, TransactionContext};
use crate::crypto::SignatureVerifier;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Number of trailing blocks whose median timestamp bounds the next block
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum seconds a block timestamp may run ahead of local time
pub const MAX_FUTURE_BLOCK_TIME: i64 = 7200;

/// Rules every node on a network must agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Compact target of the genesis block and the first retarget period
    pub initial_bits: u32,
    /// Easiest target retargeting may reach
    pub pow_limit_bits: u32,
    /// Blocks between difficulty adjustments
    pub retarget_interval: u64,
    pub target_block_time_secs: i64,
    /// Bound on how far one retarget may move the target, in either direction
    pub max_adjustment_factor: u32,
    /// Maximum reward per block
    pub block_reward: u64,
    /// Total coins that may ever be issued
    pub max_supply: u64,
    /// Transactions per block, reward included
    pub max_block_transactions: usize,
    /// Unix seconds stamped on the genesis block
    pub genesis_timestamp: i64,
    pub max_future_block_time_secs: i64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            initial_bits: DEFAULT_BITS,
            pow_limit_bits: REGTEST_BITS,
            retarget_interval: 10,
            target_block_time_secs: 10,
            max_adjustment_factor: 4,
            block_reward: 50,
            max_supply: 21_000_000,
            max_block_transactions: MAX_BLOCK_TXS,
            genesis_timestamp: 1_704_067_200,
            max_future_block_time_secs: MAX_FUTURE_BLOCK_TIME,
        }
    }
}

impl ConsensusParams {
    /// Trivial work for tests and local networks
    pub fn regtest() -> Self {
        Self {
            initial_bits: REGTEST_BITS,
            ..Self::default()
        }
    }
}

/// Blockchain-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("Invalid block at index {index}: {source}")]
    InvalidBlock {
        index: u64,
        #[source]
        source: BlockError,
    },
    #[error("Chain is empty")]
    EmptyChain,
    #[error("Genesis mismatch: expected {expected}, found {found}")]
    GenesisMismatch { expected: String, found: String },
}

/// Chain statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Number of blocks, genesis included
    pub length: u64,
    pub height: u64,
    pub tip_hash: String,
    pub tip_timestamp: DateTime<Utc>,
    /// Bits required of the next block
    pub bits: u32,
    /// Hex target for `bits`
    pub target: String,
    pub supply: u64,
    /// Decimal cumulative work
    pub chain_work: String,
    pub total_transactions: u64,
    pub accounts: usize,
}

/// A validated candidate chain, ready to be swapped in
pub struct Replacement {
    pub chain: Blockchain,
    /// Length of the prefix shared with the current chain
    pub fork_index: u64,
    /// Current blocks that the candidate drops
    pub orphaned: Vec<Block>,
}

/// The main blockchain structure
#[derive(Clone)]
pub struct Blockchain {
    /// Never empty: genesis is always present
    blocks: Vec<Block>,
    balances: BalanceView,
    difficulty: DifficultyState,
    supply: u64,
    confirmed: HashSet<String>,
    params: ConsensusParams,
    verifier: Arc<dyn SignatureVerifier>,
}

impl fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blockchain")
            .field("length", &self.blocks.len())
            .field("tip", &self.latest_block().hash)
            .field("supply", &self.supply)
            .finish_non_exhaustive()
    }
}

impl Blockchain {
    /// Create a new blockchain holding only the genesis block
    pub fn new(params: ConsensusParams, verifier: Arc<dyn SignatureVerifier>) -> Self {
        let genesis = Block::genesis(&params);
        let mut difficulty = DifficultyState::new(&params);
        difficulty.observe(0, genesis.header.timestamp, genesis.header.bits);

        Self {
            blocks: vec![genesis],
            balances: BalanceView::new(),
            difficulty,
            supply: 0,
            confirmed: HashSet::new(),
            params,
            verifier,
        }
    }

    /// Rebuild a chain from stored blocks, validating every one
    pub fn from_blocks(
        blocks: Vec<Block>,
        params: ConsensusParams,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, BlockchainError> {
        let mut chain = Self::new(params, verifier);
        chain.check_genesis(&blocks)?;
        for block in blocks.into_iter().skip(1) {
            chain.append_indexed(block)?;
        }
        Ok(chain)
    }

    fn check_genesis(&self, blocks: &[Block]) -> Result<(), BlockchainError> {
        let first = blocks.first().ok_or(BlockchainError::EmptyChain)?;
        let genesis = &self.blocks[0];
        if first.hash != genesis.hash || first != genesis {
            return Err(BlockchainError::GenesisMismatch {
                expected: genesis.hash.clone(),
                found: first.hash.clone(),
            });
        }
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn verifier(&self) -> &Arc<dyn SignatureVerifier> {
        &self.verifier
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[0]
    }

    /// Get the latest block
    pub fn latest_block(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    /// Get a block by index
    pub fn get_block(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    /// Get a block by hash
    pub fn get_block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash == hash)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Blocks from `index` to the tip; empty past the tip
    pub fn blocks_from(&self, index: u64) -> &[Block] {
        let start = usize::try_from(index).unwrap_or(usize::MAX);
        self.blocks.get(start..).unwrap_or(&[])
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Never true: genesis is always present
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get blockchain height
    pub fn height(&self) -> u64 {
        self.latest_block().index
    }

    pub fn balances(&self) -> &BalanceView {
        &self.balances
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.balances.balance_of(address)
    }

    /// Coins issued so far
    pub fn supply(&self) -> u64 {
        self.supply
    }

    /// Recount issued coins from the blocks themselves
    pub fn current_supply(&self) -> Result<u64, BlockError> {
        let mut supply = 0u64;
        for block in &self.blocks {
            let reward = block.reward_amount();
            supply = supply
                .checked_add(reward)
                .filter(|total| *total <= self.params.max_supply)
                .ok_or(BlockError::SupplyCapExceeded {
                    supply,
                    reward,
                    cap: self.params.max_supply,
                })?;
        }
        Ok(supply)
    }

    pub fn confirmed(&self) -> &HashSet<String> {
        &self.confirmed
    }

    pub fn contains_tx(&self, id: &str) -> bool {
        self.confirmed.contains(id)
    }

    /// Bits required of the next block
    pub fn next_bits(&self) -> u32 {
        self.difficulty.next_bits(self.len())
    }

    /// Median timestamp of the last [`MEDIAN_TIME_SPAN`] blocks
    pub fn median_time_past(&self) -> DateTime<Utc> {
        let start = self.blocks.len().saturating_sub(MEDIAN_TIME_SPAN);
        let mut times: Vec<DateTime<Utc>> = self.blocks[start..]
            .iter()
            .map(|b| b.header.timestamp)
            .collect();
        times.sort();
        times[times.len() / 2]
    }

    /// Cumulative expected work of every block
    pub fn chain_work(&self) -> BigUint {
        self.blocks
            .iter()
            .fold(BigUint::default(), |acc, b| acc + block_work(b.header.bits))
    }

    fn context(&self, now: DateTime<Utc>) -> ChainContext<'_> {
        ChainContext {
            tip: self.latest_block(),
            expected_bits: self.next_bits(),
            median_time_past: self.median_time_past(),
            balances: &self.balances,
            supply: self.supply,
            txs: self.transaction_context(now),
        }
    }

    /// Context for validating loose transactions against the tip
    pub fn transaction_context(&self, now: DateTime<Utc>) -> TransactionContext<'_> {
        TransactionContext {
            confirmed: &self.confirmed,
            verifier: self.verifier.as_ref(),
            params: &self.params,
            now,
        }
    }

    /// Validate a block as the next block without changing anything
    pub fn validate_block(&self, block: &Block) -> Result<BlockEffects, BlockError> {
        validate_block(block, &self.context(Utc::now()))
    }

    /// Validate and append a block
    pub fn append_block(&mut self, block: Block) -> Result<(), BlockError> {
        let effects = self.validate_block(&block)?;

        let old_bits = block.header.bits;
        self.commit(block, effects);

        let new_bits = self.next_bits();
        if new_bits != old_bits {
            log::info!(
                "Difficulty retarget at height {}: {:#010x} -> {:#010x}",
                self.len(),
                old_bits,
                new_bits
            );
        }
        Ok(())
    }

    fn append_indexed(&mut self, block: Block) -> Result<(), BlockchainError> {
        let index = block.index;
        self.append_block(block)
            .map_err(|source| BlockchainError::InvalidBlock { index, source })
    }

    fn commit(&mut self, block: Block, effects: BlockEffects) {
        self.balances.commit(effects.balance_changes);
        self.supply = self.supply.saturating_add(effects.minted);
        self.confirmed.extend(effects.tx_ids);
        self.difficulty
            .observe(block.index, block.header.timestamp, block.header.bits);
        self.blocks.push(block);
    }

    /// Append a block that this node already accepted once. Only the
    /// balance arithmetic is redone; signatures and work are not rechecked.
    fn replay_trusted(&mut self, block: Block) -> Result<(), BlockchainError> {
        let invalid = |i: usize, e| BlockchainError::InvalidBlock {
            index: block.index,
            source: BlockError::InvalidTransaction(i, e),
        };

        let recipient = block
            .reward_tx()
            .map(|tx| tx.recipient.clone())
            .unwrap_or_default();
        let mut overlay = BalanceOverlay::new(&self.balances);
        for (i, tx) in block.transactions.iter().enumerate() {
            let applied = if tx.is_reward() {
                overlay.credit(&tx.recipient, tx.amount)
            } else {
                overlay.apply_transfer(tx, &recipient)
            };
            applied.map_err(|e| invalid(i, e))?;
        }

        let effects = BlockEffects {
            balance_changes: overlay.into_changes(),
            minted: block.reward_amount(),
            tx_ids: block.transactions.iter().map(|tx| tx.id.clone()).collect(),
        };
        self.commit(block, effects);
        Ok(())
    }

    /// Build the chain that `candidate` would become.
    ///
    /// The prefix shared with this chain is replayed from our own copies
    /// without re-validation. A candidate block counts as shared only if it
    /// is identical to ours, not merely labelled with the same hash. Every
    /// block after the fork point is fully validated. `self` is left
    /// untouched.
    pub fn plan_replacement(&self, candidate: Vec<Block>) -> Result<Replacement, BlockchainError> {
        self.check_genesis(&candidate)?;

        let shared = self
            .blocks
            .iter()
            .zip(candidate.iter())
            .take_while(|(ours, theirs)| ours == theirs)
            .count();

        let mut chain = Self::new(self.params, Arc::clone(&self.verifier));
        for block in self.blocks.iter().take(shared).skip(1) {
            chain.replay_trusted(block.clone())?;
        }
        for block in candidate.into_iter().skip(shared.max(1)) {
            chain.append_indexed(block)?;
        }

        Ok(Replacement {
            chain,
            fork_index: shared as u64,
            orphaned: self.blocks[shared..].to_vec(),
        })
    }

    /// Validate the entire chain
    pub fn is_valid(&self) -> bool {
        Self::from_blocks(self.blocks.clone(), self.params, Arc::clone(&self.verifier)).is_ok()
    }

    /// Non-reward transactions of `blocks`, in chain order
    pub fn transfers_of(blocks: &[Block]) -> Vec<Transaction> {
        blocks
            .iter()
            .flat_map(|b| b.transfers().cloned())
            .collect()
    }

    /// Get chain statistics
    pub fn stats(&self) -> ChainInfo {
        let tip = self.latest_block();
        let bits = self.next_bits();
        let target = expand_compact(bits)
            .map(|t| format!("{:064x}", t))
            .unwrap_or_default();

        ChainInfo {
            length: self.len(),
            height: self.height(),
            tip_hash: tip.hash.clone(),
            tip_timestamp: tip.header.timestamp,
            bits,
            target,
            supply: self.supply,
            chain_work: self.chain_work().to_string(),
            total_transactions: self.blocks.iter().map(|b| b.tx_count() as u64).sum(),
            accounts: self.balances.accounts(),
        }
    }
}
