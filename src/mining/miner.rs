//! Mining engine for the blockchain
//!
//! Mining works on a [`MiningSnapshot`] taken from the ledger, so no lock is
//! held while hashing. Work is always bounded: a call tries at most
//! `max_attempts` nonces and either returns a block or says where to resume.

use crate::core::block::{Block, NonceSearch};
use crate::core::transaction::Transaction;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::time::{Duration, Instant};

/// Chain facts needed to build a candidate block
#[derive(Debug, Clone)]
pub struct MiningSnapshot {
    pub tip_hash: String,
    pub next_index: u64,
    /// Bits required of the next block
    pub bits: u32,
    pub median_time_past: DateTime<Utc>,
    /// Coins issued so far
    pub supply: u64,
    pub block_reward: u64,
    pub max_supply: u64,
    /// Mempool selection, highest fee first
    pub transactions: Vec<Transaction>,
}

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

impl MiningStats {
    fn new(hash_attempts: u64, elapsed: Duration) -> Self {
        let time_ms = elapsed.as_millis();
        let secs = elapsed.as_secs_f64();
        let hash_rate = if secs > 0.0 {
            hash_attempts as f64 / secs
        } else {
            hash_attempts as f64
        };
        Self {
            hash_attempts,
            time_ms,
            hash_rate,
        }
    }
}

/// Outcome of a synchronous search
#[derive(Debug, Clone)]
pub enum MineResult {
    Found(Block, MiningStats),
    /// `last_nonce` is where the search stopped; resuming there continues
    /// the same nonce sequence
    Exhausted { last_nonce: u64, elapsed: Duration },
}

/// A partially searched candidate.
///
/// Pins the candidate's transactions, parent and bits. Once the tip moves
/// the state is stale and should be discarded.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub candidate: Block,
    pub next_nonce: u64,
    /// Attempts made across all calls so far
    pub attempts: u64,
    /// Time spent hashing across all calls so far
    pub elapsed: Duration,
}

impl ResumeState {
    pub fn new(candidate: Block) -> Self {
        let next_nonce = candidate.header.nonce;
        Self {
            candidate,
            next_nonce,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Hash of the block the candidate builds on
    pub fn tip_hash(&self) -> &str {
        self.candidate.previous_hash()
    }
}

/// Outcome of one incremental step
#[derive(Debug, Clone)]
pub enum IncrementalResult {
    Found(Block, MiningStats),
    Continue(ResumeState),
}

/// Miner for creating new blocks
#[derive(Debug, Clone)]
pub struct Miner {
    /// Miner's address for receiving rewards
    pub address: String,
}

impl Miner {
    /// Create a new miner
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }

    /// Assemble an unmined block on top of the snapshot's tip. The reward
    /// shrinks to whatever is left under the supply cap.
    pub fn build_candidate(&self, snapshot: &MiningSnapshot) -> Block {
        let reward = snapshot
            .block_reward
            .min(snapshot.max_supply.saturating_sub(snapshot.supply));
        let timestamp = Utc::now().max(snapshot.median_time_past);

        let mut transactions = Vec::with_capacity(snapshot.transactions.len() + 1);
        transactions.push(Transaction::reward(
            &self.address,
            reward,
            snapshot.next_index,
            timestamp,
        ));
        transactions.extend(snapshot.transactions.iter().cloned());

        Block::new(
            snapshot.next_index,
            snapshot.tip_hash.clone(),
            transactions,
            snapshot.bits,
            timestamp,
        )
    }

    /// Search up to `max_attempts` nonces from the candidate's current nonce
    pub fn mine_synchronous(&self, mut candidate: Block, max_attempts: u64) -> MineResult {
        let start = Instant::now();
        let start_nonce = candidate.header.nonce;

        debug!(
            "Mining block {} with bits {:#010x}...",
            candidate.index, candidate.header.bits
        );

        match candidate.search_nonce(start_nonce, max_attempts) {
            NonceSearch::Found { attempts, .. } => {
                let stats = MiningStats::new(attempts, start.elapsed());
                info!(
                    "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
                    candidate.index, stats.time_ms, attempts, stats.hash_rate
                );
                MineResult::Found(candidate, stats)
            }
            NonceSearch::Exhausted { next_nonce, .. } => MineResult::Exhausted {
                last_nonce: next_nonce,
                elapsed: start.elapsed(),
            },
        }
    }

    /// Continue a search for at most `max_attempts` more nonces
    pub fn mine_incremental(&self, mut state: ResumeState, max_attempts: u64) -> IncrementalResult {
        let start = Instant::now();
        let outcome = state.candidate.search_nonce(state.next_nonce, max_attempts);
        state.elapsed += start.elapsed();

        match outcome {
            NonceSearch::Found { attempts, .. } => {
                let total = state.attempts.saturating_add(attempts);
                let stats = MiningStats::new(total, state.elapsed);
                info!(
                    "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
                    state.candidate.index, stats.time_ms, total, stats.hash_rate
                );
                IncrementalResult::Found(state.candidate, stats)
            }
            NonceSearch::Exhausted {
                next_nonce,
                attempts,
            } => {
                state.next_nonce = next_nonce;
                state.attempts = state.attempts.saturating_add(attempts);
                IncrementalResult::Continue(state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::difficulty::{DEFAULT_BITS, REGTEST_BITS};
    use crate::crypto::ZERO_HASH;

    fn snapshot(bits: u32) -> MiningSnapshot {
        MiningSnapshot {
            tip_hash: ZERO_HASH.to_string(),
            next_index: 1,
            bits,
            median_time_past: Utc::now(),
            supply: 0,
            block_reward: 50,
            max_supply: 1_000,
            transactions: vec![Transaction::transfer("alice", "bob", 5, 1, 0)],
        }
    }

    #[test]
    fn test_candidate_layout() {
        let miner = Miner::new("miner");
        let block = miner.build_candidate(&snapshot(REGTEST_BITS));

        assert_eq!(block.index, 1);
        assert_eq!(block.transactions.len(), 2);
        let reward = block.reward_tx().unwrap();
        assert_eq!(reward.recipient, "miner");
        assert_eq!(reward.amount, 50);
        assert_eq!(reward.nonce, 1);
    }

    #[test]
    fn test_reward_respects_supply_cap() {
        let miner = Miner::new("miner");
        let mut snap = snapshot(REGTEST_BITS);

        snap.supply = 980;
        assert_eq!(miner.build_candidate(&snap).reward_amount(), 20);

        snap.supply = 1_000;
        assert_eq!(miner.build_candidate(&snap).reward_amount(), 0);
    }

    #[test]
    fn test_timestamp_not_before_median() {
        let miner = Miner::new("miner");
        let mut snap = snapshot(REGTEST_BITS);
        snap.median_time_past = Utc::now() + chrono::Duration::seconds(30);
        let block = miner.build_candidate(&snap);
        assert_eq!(block.header.timestamp, snap.median_time_past);
    }

    #[test]
    fn test_zero_attempts_exhausted() {
        let miner = Miner::new("miner");
        let candidate = miner.build_candidate(&snapshot(REGTEST_BITS));
        match miner.mine_synchronous(candidate, 0) {
            MineResult::Exhausted { last_nonce, .. } => assert_eq!(last_nonce, 0),
            MineResult::Found(..) => panic!("zero attempts must not find a block"),
        }
    }

    #[test]
    fn test_synchronous_finds_easy_block() {
        let miner = Miner::new("miner");
        let candidate = miner.build_candidate(&snapshot(REGTEST_BITS));
        match miner.mine_synchronous(candidate, 10_000) {
            MineResult::Found(block, stats) => {
                assert!(block.meets_target());
                assert!(block.verify_hash());
                assert!(stats.hash_attempts >= 1);
            }
            MineResult::Exhausted { .. } => panic!("regtest target should be found"),
        }
    }

    #[test]
    fn test_incremental_matches_synchronous() {
        let miner = Miner::new("miner");
        for bits in [DEFAULT_BITS, 0x0100_0001] {
            let candidate = miner.build_candidate(&snapshot(bits));

            let sync = miner.mine_synchronous(candidate.clone(), 3_000);

            let mut state = ResumeState::new(candidate);
            let mut incremental = None;
            for _ in 0..3 {
                match miner.mine_incremental(state.clone(), 1_000) {
                    IncrementalResult::Found(block, stats) => {
                        incremental = Some((block, stats));
                        break;
                    }
                    IncrementalResult::Continue(next) => state = next,
                }
            }

            match (sync, incremental) {
                (MineResult::Found(a, a_stats), Some((b, b_stats))) => {
                    assert_eq!(a, b);
                    assert_eq!(a_stats.hash_attempts, b_stats.hash_attempts);
                }
                (MineResult::Exhausted { last_nonce, .. }, None) => {
                    assert_eq!(last_nonce, 3_000);
                    assert_eq!(state.next_nonce, 3_000);
                    assert_eq!(state.attempts, 3_000);
                }
                _ => panic!("incremental and synchronous search disagree"),
            }
        }
    }

    #[test]
    fn test_resume_state_pins_tip() {
        let miner = Miner::new("miner");
        let state = ResumeState::new(miner.build_candidate(&snapshot(REGTEST_BITS)));
        assert_eq!(state.tip_hash(), ZERO_HASH);
        assert_eq!(state.next_nonce, 0);
    }
}
