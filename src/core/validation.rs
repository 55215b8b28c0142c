//! Transaction and block validation
//!
//! Pure checks over borrowed snapshots: nothing here takes a lock, touches
//! storage or reads the clock. Callers pass "now" in through the context.

use crate::core::balance::{BalanceOverlay, BalanceSource, BalanceView};
use crate::core::block::{Block, BlockError};
use crate::core::blockchain::ConsensusParams;
use crate::core::transaction::{Address, Transaction, TransactionError, TransactionKind};
use crate::crypto::SignatureVerifier;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Chain facts a single transaction is checked against
pub struct TransactionContext<'a> {
    /// Ids already confirmed on the chain
    pub confirmed: &'a HashSet<String>,
    pub verifier: &'a dyn SignatureVerifier,
    pub params: &'a ConsensusParams,
    pub now: DateTime<Utc>,
}

/// Chain state *before* the block under validation
pub struct ChainContext<'a> {
    pub tip: &'a Block,
    pub expected_bits: u32,
    pub median_time_past: DateTime<Utc>,
    pub balances: &'a BalanceView,
    /// Coins issued so far
    pub supply: u64,
    pub txs: TransactionContext<'a>,
}

/// What committing a valid block changes
#[derive(Debug, Clone, Default)]
pub struct BlockEffects {
    /// Final balance of every touched account
    pub balance_changes: HashMap<Address, u64>,
    /// Newly issued coins
    pub minted: u64,
    pub tx_ids: Vec<String>,
}

fn malformed(reason: &str) -> TransactionError {
    TransactionError::MalformedFields(reason.to_string())
}

/// Field presence and range checks shared by every transaction kind
fn check_common_fields(tx: &Transaction, ctx: &TransactionContext) -> Result<(), TransactionError> {
    if !tx.has_valid_id() {
        return Err(malformed("id does not match contents"));
    }
    if tx.recipient.is_empty() {
        return Err(malformed("missing recipient"));
    }
    let horizon = ctx.now + Duration::seconds(ctx.params.max_future_block_time_secs);
    if tx.timestamp > horizon {
        return Err(malformed("timestamp too far in the future"));
    }
    if ctx.confirmed.contains(&tx.id) {
        return Err(TransactionError::AlreadyConfirmed(tx.id.clone()));
    }
    Ok(())
}

/// Validate a transfer against `balances`.
///
/// `pending_outflow` is what the sender already owes through other
/// not-yet-confirmed transactions, so that several pending spends cannot
/// together exceed the balance.
pub fn validate_transaction<B: BalanceSource + ?Sized>(
    tx: &Transaction,
    balances: &B,
    pending_outflow: u64,
    ctx: &TransactionContext,
) -> Result<(), TransactionError> {
    if tx.kind != TransactionKind::Transfer {
        return Err(malformed("reward transactions are only valid as the first entry of a block"));
    }
    check_common_fields(tx, ctx)?;

    if tx.sender.is_empty() {
        return Err(malformed("missing sender"));
    }
    if tx.sender == tx.recipient {
        return Err(malformed("sender and recipient are identical"));
    }
    if tx.amount == 0 {
        return Err(malformed("amount must be positive"));
    }
    let debit = tx
        .total_debit()
        .ok_or_else(|| malformed("amount + fee overflows"))?;

    let signature = tx
        .signature_bytes()
        .filter(|sig| !sig.is_empty())
        .ok_or(TransactionError::InvalidSignature)?;
    if !ctx.verifier.verify(&tx.sender, &tx.signing_data(), &signature) {
        return Err(TransactionError::InvalidSignature);
    }

    check_funds(tx, debit, balances, pending_outflow)
}

fn check_funds<B: BalanceSource + ?Sized>(
    tx: &Transaction,
    debit: u64,
    balances: &B,
    pending_outflow: u64,
) -> Result<(), TransactionError> {
    let required = debit
        .checked_add(pending_outflow)
        .ok_or_else(|| malformed("pending outflow overflows"))?;
    let available = balances.balance_of(&tx.sender);
    if required > available {
        return Err(TransactionError::InsufficientFunds {
            required,
            available,
        });
    }
    Ok(())
}

/// Re-check a transfer that already passed [`validate_transaction`] against
/// a newer chain state. Only the replay and funds rules are evaluated again;
/// fields and signature are fixed by the id.
pub fn recheck_transaction<B: BalanceSource + ?Sized>(
    tx: &Transaction,
    balances: &B,
    pending_outflow: u64,
    ctx: &TransactionContext,
) -> Result<(), TransactionError> {
    if ctx.confirmed.contains(&tx.id) {
        return Err(TransactionError::AlreadyConfirmed(tx.id.clone()));
    }
    let debit = tx
        .total_debit()
        .ok_or_else(|| malformed("amount + fee overflows"))?;
    check_funds(tx, debit, balances, pending_outflow)
}

/// Shape checks for the reward at the head of block `index`
fn validate_reward(
    tx: &Transaction,
    index: u64,
    ctx: &TransactionContext,
) -> Result<(), TransactionError> {
    if tx.kind != TransactionKind::Reward {
        return Err(malformed("block must start with a reward transaction"));
    }
    check_common_fields(tx, ctx)?;

    if !tx.sender.is_empty() || !tx.signature.is_empty() {
        return Err(malformed("reward carries a sender or signature"));
    }
    if tx.fee != 0 {
        return Err(malformed("reward carries a fee"));
    }
    if tx.nonce != index {
        return Err(malformed("reward nonce does not match the block index"));
    }
    if tx.amount > ctx.params.block_reward {
        return Err(malformed("reward exceeds the block subsidy"));
    }
    Ok(())
}

/// Validate `block` as the successor of `ctx.tip`.
///
/// On success returns the effects to commit; the caller's state is not
/// modified either way.
pub fn validate_block(block: &Block, ctx: &ChainContext) -> Result<BlockEffects, BlockError> {
    let params = ctx.txs.params;

    // Linkage
    let expected_index = ctx.tip.index + 1;
    if block.index != expected_index || block.header.previous_hash != ctx.tip.hash {
        return Err(BlockError::BadLinkage {
            expected_index,
            index: block.index,
            expected_previous: ctx.tip.hash.clone(),
            previous: block.header.previous_hash.clone(),
        });
    }

    if block.header.bits != ctx.expected_bits {
        return Err(BlockError::BadDifficulty(format!(
            "expected bits {:#010x}, got {:#010x}",
            ctx.expected_bits, block.header.bits
        )));
    }

    // Hash and body commitment
    if !block.verify_hash() || !block.verify_merkle_root() {
        return Err(BlockError::BadHash);
    }
    if !block.meets_target() {
        return Err(BlockError::BadDifficulty(format!(
            "hash {} is above the target for bits {:#010x}",
            block.hash, block.header.bits
        )));
    }

    let timestamp = block.header.timestamp;
    if timestamp < ctx.median_time_past {
        return Err(BlockError::BadTimestamp(format!(
            "{} is before the median time past {}",
            timestamp, ctx.median_time_past
        )));
    }
    if timestamp > ctx.txs.now + Duration::seconds(params.max_future_block_time_secs) {
        return Err(BlockError::BadTimestamp(format!(
            "{} is too far in the future",
            timestamp
        )));
    }

    if block.transactions.len() > params.max_block_transactions {
        return Err(BlockError::TooManyTransactions(
            block.transactions.len(),
            params.max_block_transactions,
        ));
    }

    let reward = block.transactions.first().ok_or_else(|| {
        BlockError::InvalidTransaction(0, malformed("block must start with a reward transaction"))
    })?;
    validate_reward(reward, block.index, &ctx.txs)
        .map_err(|e| BlockError::InvalidTransaction(0, e))?;

    match ctx.supply.checked_add(reward.amount) {
        Some(total) if total <= params.max_supply => {}
        _ => {
            return Err(BlockError::SupplyCapExceeded {
                supply: ctx.supply,
                reward: reward.amount,
                cap: params.max_supply,
            })
        }
    }

    let mut overlay = BalanceOverlay::new(ctx.balances);
    overlay
        .credit(&reward.recipient, reward.amount)
        .map_err(|e| BlockError::InvalidTransaction(0, e))?;

    let mut seen = HashSet::with_capacity(block.transactions.len());
    seen.insert(reward.id.as_str());

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if !seen.insert(tx.id.as_str()) {
            return Err(BlockError::InvalidTransaction(
                i,
                malformed("duplicate transaction in block"),
            ));
        }
        validate_transaction(tx, &overlay, 0, &ctx.txs)
            .and_then(|_| overlay.apply_transfer(tx, &reward.recipient))
            .map_err(|e| BlockError::InvalidTransaction(i, e))?;
    }

    Ok(BlockEffects {
        balance_changes: overlay.into_changes(),
        minted: reward.amount,
        tx_ids: block.transactions.iter().map(|tx| tx.id.clone()).collect(),
    })
}
