//! Transaction pool (mempool) for pending transactions
//!
//! Holds validated transfers waiting for a block. Every entry is valid
//! against the current tip *together with* every other entry: each sender's
//! pending outflow is tracked so that two pending spends can never exceed
//! the balance between them.

use crate::core::balance::BalanceSource;
use crate::core::transaction::{Address, Transaction, TransactionError};
use crate::core::validation::{recheck_transaction, validate_transaction, TransactionContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum mempool transaction count
pub const DEFAULT_MEMPOOL_SIZE: usize = 10_000;

// =============================================================================
// Error Types
// =============================================================================

/// Mempool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction validation error: {0}")]
    Invalid(#[from] TransactionError),
    #[error("Mempool full")]
    MempoolFull,
}

/// Result of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Accepted,
    /// An identical transaction is already pending; nothing changed
    AlreadyPending,
}

// =============================================================================
// Mempool Entry
// =============================================================================

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// Arrival order, unique within the pool's lifetime
    pub sequence: u64,
    pub added_at: DateTime<Utc>,
}

// =============================================================================
// Mempool
// =============================================================================

/// Memory pool for pending transactions
#[derive(Debug)]
pub struct Mempool {
    /// Transactions indexed by ID
    entries: HashMap<String, MempoolEntry>,
    /// amount + fee owed by each sender across its pending entries
    outflow: HashMap<Address, u64>,
    next_sequence: u64,
    max_size: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    /// Create a new mempool
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_SIZE)
    }

    /// Create a mempool holding at most `max_size` transactions
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            outflow: HashMap::new(),
            next_sequence: 0,
            max_size,
        }
    }

    /// Amount already owed by `sender` through pending transactions
    pub fn pending_outflow(&self, sender: &str) -> u64 {
        self.outflow.get(sender).copied().unwrap_or(0)
    }

    /// Validate and add a transaction.
    ///
    /// Resubmitting a pending transaction is a no-op. When the pool is full
    /// the cheapest entry makes room for a newcomer paying a strictly higher
    /// fee; otherwise the newcomer is refused.
    pub fn submit<B: BalanceSource + ?Sized>(
        &mut self,
        tx: Transaction,
        balances: &B,
        ctx: &TransactionContext,
    ) -> Result<SubmitOutcome, MempoolError> {
        if self.entries.contains_key(&tx.id) {
            return Ok(SubmitOutcome::AlreadyPending);
        }

        validate_transaction(&tx, balances, self.pending_outflow(&tx.sender), ctx)?;

        if self.entries.len() >= self.max_size {
            match self.cheapest() {
                Some((id, fee)) if tx.fee > fee => {
                    log::debug!("Mempool full, evicting {} (fee {})", id, fee);
                    self.remove(&id);
                }
                _ => return Err(MempoolError::MempoolFull),
            }
        }

        log::debug!("Mempool accepted {} (fee {})", tx.id, tx.fee);
        self.insert(tx, ctx.now);
        Ok(SubmitOutcome::Accepted)
    }

    fn insert(&mut self, tx: Transaction, now: DateTime<Utc>) {
        let debit = tx.total_debit().unwrap_or(u64::MAX);
        let owed = self.outflow.entry(tx.sender.clone()).or_insert(0);
        *owed = owed.saturating_add(debit);

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            tx.id.clone(),
            MempoolEntry {
                tx,
                sequence,
                added_at: now,
            },
        );
    }

    /// Lowest-fee entry; among equals, the most recent arrival
    fn cheapest(&self) -> Option<(String, u64)> {
        self.entries
            .values()
            .min_by(|a, b| {
                a.tx.fee
                    .cmp(&b.tx.fee)
                    .then_with(|| b.sequence.cmp(&a.sequence))
            })
            .map(|e| (e.tx.id.clone(), e.tx.fee))
    }

    /// Remove a transaction and release its sender's outflow
    pub fn remove(&mut self, id: &str) -> Option<Transaction> {
        let entry = self.entries.remove(id)?;
        let debit = entry.tx.total_debit().unwrap_or(u64::MAX);
        if let Some(owed) = self.outflow.get_mut(&entry.tx.sender) {
            *owed = owed.saturating_sub(debit);
            if *owed == 0 {
                self.outflow.remove(&entry.tx.sender);
            }
        }
        Some(entry.tx)
    }

    fn ordered_entries(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Highest fee first, ties broken by arrival. Nothing is removed.
    pub fn select_for_block(&self, max_count: usize) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.tx.fee
                .cmp(&a.tx.fee)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        entries
            .into_iter()
            .take(max_count)
            .map(|e| e.tx.clone())
            .collect()
    }

    /// Bring the pool in line with a new tip.
    ///
    /// Drops the transactions in `included`, then re-checks the funds and
    /// confirmation status of every remaining entry in arrival order and
    /// evicts those that no longer fit. Signatures are not verified again.
    /// Returns the evicted ids (not the included ones).
    pub fn reconcile<B: BalanceSource + ?Sized>(
        &mut self,
        included: &[String],
        balances: &B,
        ctx: &TransactionContext,
    ) -> Vec<String> {
        for id in included {
            self.remove(id);
        }

        let remaining: Vec<MempoolEntry> = self.ordered_entries().into_iter().cloned().collect();
        self.entries.clear();
        self.outflow.clear();

        let mut evicted = Vec::new();
        for entry in remaining {
            let pending = self.pending_outflow(&entry.tx.sender);
            match recheck_transaction(&entry.tx, balances, pending, ctx) {
                Ok(()) => {
                    let debit = entry.tx.total_debit().unwrap_or(u64::MAX);
                    let owed = self.outflow.entry(entry.tx.sender.clone()).or_insert(0);
                    *owed = owed.saturating_add(debit);
                    self.entries.insert(entry.tx.id.clone(), entry);
                }
                Err(e) => {
                    log::debug!("Evicting {} from mempool: {}", entry.tx.id, e);
                    evicted.push(entry.tx.id);
                }
            }
        }
        evicted
    }

    /// Resubmit transactions from blocks dropped by a reorganization.
    /// Ones that no longer validate are discarded. Returns how many were
    /// admitted.
    pub fn readmit<B: BalanceSource + ?Sized>(
        &mut self,
        txs: Vec<Transaction>,
        balances: &B,
        ctx: &TransactionContext,
    ) -> usize {
        let mut admitted = 0;
        for tx in txs {
            let id = tx.id.clone();
            match self.submit(tx, balances, ctx) {
                Ok(SubmitOutcome::Accepted) => admitted += 1,
                Ok(SubmitOutcome::AlreadyPending) => {}
                Err(e) => log::debug!("Dropping orphaned transaction {}: {}", id, e),
            }
        }
        admitted
    }

    /// Pending transactions in arrival order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.ordered_entries()
            .into_iter()
            .map(|e| e.tx.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Transaction> {
        self.entries.get(id).map(|e| &e.tx)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            count: self.entries.len(),
            capacity: self.max_size,
            total_fees: self
                .entries
                .values()
                .fold(0u64, |acc, e| acc.saturating_add(e.tx.fee)),
            senders: self.outflow.len(),
        }
    }
}

/// Mempool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolStats {
    pub count: usize,
    pub capacity: usize,
    pub total_fees: u64,
    pub senders: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::balance::BalanceView;
    use crate::core::blockchain::ConsensusParams;
    use crate::crypto::{KeyPair, Secp256k1Verifier, SignatureVerifier};
    use std::collections::HashSet;

    struct Fixture {
        balances: BalanceView,
        confirmed: HashSet<String>,
        verifier: Secp256k1Verifier,
        params: ConsensusParams,
    }

    impl Fixture {
        fn new(funded: &[(&KeyPair, u64)]) -> Self {
            let mut balances = BalanceView::new();
            balances.commit(
                funded
                    .iter()
                    .map(|(kp, amount)| (kp.public_key_hex(), *amount))
                    .collect(),
            );
            Self {
                balances,
                confirmed: HashSet::new(),
                verifier: Secp256k1Verifier::new(),
                params: ConsensusParams::regtest(),
            }
        }

        fn ctx(&self) -> TransactionContext<'_> {
            TransactionContext {
                confirmed: &self.confirmed,
                verifier: &self.verifier,
                params: &self.params,
                now: Utc::now(),
            }
        }
    }

    fn transfer(kp: &KeyPair, to: &str, amount: u64, fee: u64, nonce: u64) -> Transaction {
        Transaction::signed_transfer(kp, to, amount, fee, nonce).unwrap()
    }

    #[test]
    fn test_submit_is_idempotent() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[(&alice, 100)]);
        let mut pool = Mempool::new();
        let tx = transfer(&alice, "bob", 10, 1, 0);

        assert_eq!(
            pool.submit(tx.clone(), &fx.balances, &fx.ctx()),
            Ok(SubmitOutcome::Accepted)
        );
        assert_eq!(
            pool.submit(tx, &fx.balances, &fx.ctx()),
            Ok(SubmitOutcome::AlreadyPending)
        );
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.pending_outflow(&alice.public_key_hex()), 11);
    }

    #[test]
    fn test_conflicting_spend_rejected() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[(&alice, 50)]);
        let mut pool = Mempool::new();

        pool.submit(transfer(&alice, "bob", 30, 0, 0), &fx.balances, &fx.ctx())
            .unwrap();
        let result = pool.submit(transfer(&alice, "carol", 30, 0, 1), &fx.balances, &fx.ctx());
        assert_eq!(
            result,
            Err(MempoolError::Invalid(TransactionError::InsufficientFunds {
                required: 60,
                available: 50
            }))
        );
    }

    #[test]
    fn test_unfunded_sender_rejected() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[]);
        let mut pool = Mempool::new();
        assert!(matches!(
            pool.submit(transfer(&alice, "bob", 1, 0, 0), &fx.balances, &fx.ctx()),
            Err(MempoolError::Invalid(TransactionError::InsufficientFunds { .. }))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_select_by_fee_then_arrival() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[(&alice, 1_000)]);
        let mut pool = Mempool::new();

        let low = transfer(&alice, "bob", 10, 1, 0);
        let high = transfer(&alice, "bob", 10, 9, 1);
        let mid_first = transfer(&alice, "bob", 10, 5, 2);
        let mid_second = transfer(&alice, "bob", 10, 5, 3);
        for tx in [&low, &high, &mid_first, &mid_second] {
            pool.submit(tx.clone(), &fx.balances, &fx.ctx()).unwrap();
        }

        let ids: Vec<String> = pool.select_for_block(3).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, mid_first.id, mid_second.id]);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_full_pool_evicts_cheapest() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[(&alice, 1_000)]);
        let mut pool = Mempool::with_capacity(2);

        let cheap = transfer(&alice, "bob", 10, 1, 0);
        pool.submit(cheap.clone(), &fx.balances, &fx.ctx()).unwrap();
        pool.submit(transfer(&alice, "bob", 10, 5, 1), &fx.balances, &fx.ctx())
            .unwrap();

        assert_eq!(
            pool.submit(transfer(&alice, "bob", 10, 1, 2), &fx.balances, &fx.ctx()),
            Err(MempoolError::MempoolFull)
        );

        pool.submit(transfer(&alice, "bob", 10, 3, 3), &fx.balances, &fx.ctx())
            .unwrap();
        assert!(!pool.contains(&cheap.id));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.pending_outflow(&alice.public_key_hex()), 28);
    }

    #[test]
    fn test_reconcile_removes_included_and_invalidated() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut fx = Fixture::new(&[(&alice, 100), (&bob, 100)]);
        let mut pool = Mempool::new();

        let included = transfer(&alice, "carol", 10, 0, 0);
        let still_valid = transfer(&alice, "carol", 20, 0, 1);
        let broke = transfer(&bob, "carol", 80, 0, 0);
        for tx in [&included, &still_valid, &broke] {
            pool.submit(tx.clone(), &fx.balances, &fx.ctx()).unwrap();
        }

        // Bob spent most of his balance elsewhere
        fx.confirmed.insert(included.id.clone());
        fx.balances.commit(HashMap::from([
            (alice.public_key_hex(), 90),
            (bob.public_key_hex(), 30),
        ]));

        let evicted = pool.reconcile(&[included.id.clone()], &fx.balances, &fx.ctx());
        assert_eq!(evicted, vec![broke.id]);
        assert_eq!(pool.transactions(), vec![still_valid]);
        assert_eq!(pool.pending_outflow(&bob.public_key_hex()), 0);

        // A second reconcile with the same ids changes nothing
        assert!(pool
            .reconcile(&[included.id], &fx.balances, &fx.ctx())
            .is_empty());
        assert_eq!(pool.len(), 1);
    }

    struct RejectAll;

    impl SignatureVerifier for RejectAll {
        fn verify(&self, _public_key: &str, _message: &[u8], _signature: &[u8]) -> bool {
            false
        }
    }

    #[test]
    fn test_reconcile_does_not_reverify_signatures() {
        let alice = KeyPair::generate();
        let mut fx = Fixture::new(&[(&alice, 100)]);
        let mut pool = Mempool::new();

        let kept = transfer(&alice, "bob", 10, 0, 0);
        let confirmed = transfer(&alice, "bob", 20, 0, 1);
        for tx in [&kept, &confirmed] {
            pool.submit(tx.clone(), &fx.balances, &fx.ctx()).unwrap();
        }
        fx.confirmed.insert(confirmed.id.clone());

        let ctx = TransactionContext {
            confirmed: &fx.confirmed,
            verifier: &RejectAll,
            params: &fx.params,
            now: Utc::now(),
        };
        let evicted = pool.reconcile(&[], &fx.balances, &ctx);
        assert_eq!(evicted, vec![confirmed.id]);
        assert_eq!(pool.transactions(), vec![kept]);
        assert_eq!(pool.pending_outflow(&alice.public_key_hex()), 10);
    }

    #[test]
    fn test_readmit_skips_invalid() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[(&alice, 15)]);
        let mut pool = Mempool::new();

        let fits = transfer(&alice, "bob", 10, 0, 0);
        let too_much = transfer(&alice, "bob", 10, 0, 1);
        assert_eq!(pool.readmit(vec![fits, too_much], &fx.balances, &fx.ctx()), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_stats() {
        let alice = KeyPair::generate();
        let fx = Fixture::new(&[(&alice, 100)]);
        let mut pool = Mempool::with_capacity(5);
        pool.submit(transfer(&alice, "bob", 10, 2, 0), &fx.balances, &fx.ctx())
            .unwrap();
        pool.submit(transfer(&alice, "bob", 10, 3, 1), &fx.balances, &fx.ctx())
            .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.capacity, 5);
        assert_eq!(stats.total_fees, 5);
        assert_eq!(stats.senders, 1);
    }
}
