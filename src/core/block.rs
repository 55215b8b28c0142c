//! Block implementation for the ledger
//!
//! A block contains a header with metadata and an ordered list of
//! transactions. Its hash covers the index, every header field, and (via the
//! merkle root) the transactions.

use crate::core::blockchain::ConsensusParams;
use crate::core::difficulty::hash_meets_target;
use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::{double_sha256_hex, merkle_root_of_ids, ZERO_HASH};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current block version
pub const BLOCK_VERSION: u32 = 1;

/// Default maximum number of transactions per block, reward included
pub const MAX_BLOCK_TXS: usize = 10_000;

/// Block validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block hash does not match its contents")]
    BadHash,
    #[error(
        "Bad linkage: expected index {expected_index} after {expected_previous}, got index {index} after {previous}"
    )]
    BadLinkage {
        expected_index: u64,
        index: u64,
        expected_previous: String,
        previous: String,
    },
    #[error("Bad difficulty: {0}")]
    BadDifficulty(String),
    #[error("Bad timestamp: {0}")]
    BadTimestamp(String),
    #[error("Too many transactions: {0} (max: {1})")]
    TooManyTransactions(usize, usize),
    #[error("Invalid transaction at position {0}: {1}")]
    InvalidTransaction(usize, TransactionError),
    #[error("Reward of {reward} would raise supply {supply} past the cap of {cap}")]
    SupplyCapExceeded { supply: u64, reward: u64, cap: u64 },
}

impl BlockError {
    /// The block was built on a tip that is no longer current
    pub fn is_stale(&self) -> bool {
        matches!(self, BlockError::BadLinkage { .. })
    }
}

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,
    /// Hash of the previous block (all zeros for genesis)
    pub previous_hash: String,
    /// Merkle root of all transaction ids
    pub merkle_root: String,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Compact difficulty target
    pub bits: u32,
    /// Nonce used for proof of work
    pub nonce: u64,
}

/// Outcome of a bounded nonce search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSearch {
    /// `nonce` satisfies the target; the block now carries it
    Found { nonce: u64, attempts: u64 },
    /// No nonce in the range worked; `next_nonce` is where to resume
    Exhausted { next_nonce: u64, attempts: u64 },
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block index/height
    pub index: u64,
    /// Block header
    pub header: BlockHeader,
    /// Block hash (cached, verified on validation)
    pub hash: String,
    /// Transactions; the reward transaction comes first
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block (unmined, nonce 0)
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        bits: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            previous_hash,
            merkle_root: Self::compute_merkle_root(&transactions),
            timestamp,
            bits,
            nonce: 0,
        };

        let mut block = Self {
            index,
            header,
            hash: String::new(),
            transactions,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// The deterministic genesis block for `params`. It carries no
    /// transactions and is exempt from the work check, so every node on the
    /// same parameters derives the same hash.
    pub fn genesis(params: &ConsensusParams) -> Self {
        let timestamp = Utc
            .timestamp_opt(params.genesis_timestamp, 0)
            .single()
            .unwrap_or_default();
        Self::new(
            0,
            ZERO_HASH.to_string(),
            Vec::new(),
            params.initial_bits,
            timestamp,
        )
    }

    /// Header preimage without the nonce; mining appends nonces to it
    fn preimage_prefix(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|",
            self.header.version,
            self.index,
            self.header.previous_hash,
            self.header.merkle_root,
            self.header.timestamp.timestamp_millis(),
            self.header.bits
        )
    }

    /// Calculate the hash of the block header
    pub fn calculate_hash(&self) -> String {
        let mut preimage = self.preimage_prefix();
        preimage.push_str(&self.header.nonce.to_string());
        double_sha256_hex(preimage.as_bytes())
    }

    /// Calculate the merkle root from transactions
    pub fn compute_merkle_root(transactions: &[Transaction]) -> String {
        merkle_root_of_ids(transactions.iter().map(|tx| tx.id.as_str()))
    }

    /// Try up to `max_attempts` nonces starting at `start_nonce`.
    ///
    /// Never loops unbounded. The search also stops at the end of the nonce
    /// space.
    pub fn search_nonce(&mut self, start_nonce: u64, max_attempts: u64) -> NonceSearch {
        let prefix = self.preimage_prefix();
        let mut nonce = start_nonce;
        let mut attempts = 0u64;

        while attempts < max_attempts {
            let hash = double_sha256_hex(format!("{prefix}{nonce}").as_bytes());
            attempts += 1;

            if hash_meets_target(&hash, self.header.bits) {
                self.header.nonce = nonce;
                self.hash = hash;
                return NonceSearch::Found { nonce, attempts };
            }

            match nonce.checked_add(1) {
                Some(next) => nonce = next,
                None => break,
            }
        }

        NonceSearch::Exhausted {
            next_nonce: nonce,
            attempts,
        }
    }

    /// Check if the proof of work is valid
    pub fn meets_target(&self) -> bool {
        hash_meets_target(&self.hash, self.header.bits)
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        Self::compute_merkle_root(&self.transactions) == self.header.merkle_root
    }

    /// Verify the cached block hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn previous_hash(&self) -> &str {
        &self.header.previous_hash
    }

    /// Get the reward transaction (first transaction)
    pub fn reward_tx(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_reward())
    }

    /// Newly issued coins in this block
    pub fn reward_amount(&self) -> u64 {
        self.reward_tx().map(|tx| tx.amount).unwrap_or(0)
    }

    /// Sum of transfer fees
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_reward())
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }

    /// Non-reward transactions
    pub fn transfers(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| !tx.is_reward())
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}
