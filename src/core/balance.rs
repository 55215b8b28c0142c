//! Derived account balances
//!
//! Balances are never stored on-chain; they are the result of replaying
//! every accepted transaction. [`BalanceOverlay`] layers tentative changes on
//! top of a committed [`BalanceView`] so a block can be checked without
//! touching the committed state.

use crate::core::transaction::{Address, Transaction, TransactionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Anything that can answer "how much does this account hold"
pub trait BalanceSource {
    fn balance_of(&self, address: &str) -> u64;
}

/// Committed balances implied by a chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    balances: HashMap<Address, u64>,
}

impl BalanceView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the final balances recorded in an overlay
    pub fn commit(&mut self, changes: HashMap<Address, u64>) {
        for (address, balance) in changes {
            if balance == 0 {
                self.balances.remove(&address);
            } else {
                self.balances.insert(address, balance);
            }
        }
    }

    /// Number of accounts with a non-zero balance
    pub fn accounts(&self) -> usize {
        self.balances.len()
    }

    /// Sum of all balances
    pub fn total(&self) -> u64 {
        self.balances
            .values()
            .fold(0u64, |acc, amount| acc.saturating_add(*amount))
    }
}

impl BalanceSource for BalanceView {
    fn balance_of(&self, address: &str) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }
}

/// Tentative balance changes on top of a base view
pub struct BalanceOverlay<'a> {
    base: &'a BalanceView,
    changes: HashMap<Address, u64>,
}

impl<'a> BalanceOverlay<'a> {
    pub fn new(base: &'a BalanceView) -> Self {
        Self {
            base,
            changes: HashMap::new(),
        }
    }

    /// Credit `amount` to `address`
    pub fn credit(&mut self, address: &str, amount: u64) -> Result<(), TransactionError> {
        let balance = self
            .balance_of(address)
            .checked_add(amount)
            .ok_or_else(|| TransactionError::MalformedFields("balance overflow".to_string()))?;
        self.changes.insert(address.to_string(), balance);
        Ok(())
    }

    /// Debit `amount` from `address`
    pub fn debit(&mut self, address: &str, amount: u64) -> Result<(), TransactionError> {
        let available = self.balance_of(address);
        let balance = available
            .checked_sub(amount)
            .ok_or(TransactionError::InsufficientFunds {
                required: amount,
                available,
            })?;
        self.changes.insert(address.to_string(), balance);
        Ok(())
    }

    /// Move a transfer's value: sender pays amount + fee, recipient gets
    /// amount, `fee_recipient` gets the fee.
    pub fn apply_transfer(
        &mut self,
        tx: &Transaction,
        fee_recipient: &str,
    ) -> Result<(), TransactionError> {
        let debit = tx
            .total_debit()
            .ok_or_else(|| TransactionError::MalformedFields("amount + fee overflows".to_string()))?;
        self.debit(&tx.sender, debit)?;
        self.credit(&tx.recipient, tx.amount)?;
        if tx.fee > 0 {
            self.credit(fee_recipient, tx.fee)?;
        }
        Ok(())
    }

    /// Final balances of every touched account
    pub fn into_changes(self) -> HashMap<Address, u64> {
        self.changes
    }
}

impl BalanceSource for BalanceOverlay<'_> {
    fn balance_of(&self, address: &str) -> u64 {
        self.changes
            .get(address)
            .copied()
            .unwrap_or_else(|| self.base.balance_of(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_does_not_touch_base() {
        let base = BalanceView::new();
        let mut overlay = BalanceOverlay::new(&base);
        overlay.credit("alice", 100).unwrap();

        assert_eq!(overlay.balance_of("alice"), 100);
        assert_eq!(base.balance_of("alice"), 0);
    }

    #[test]
    fn test_debit_insufficient() {
        let mut base = BalanceView::new();
        base.commit(HashMap::from([("alice".to_string(), 5)]));

        let mut overlay = BalanceOverlay::new(&base);
        assert_eq!(
            overlay.debit("alice", 6),
            Err(TransactionError::InsufficientFunds {
                required: 6,
                available: 5
            })
        );
    }

    #[test]
    fn test_transfer_moves_fee_to_miner() {
        let mut base = BalanceView::new();
        base.commit(HashMap::from([("alice".to_string(), 100)]));

        let tx = Transaction::transfer("alice", "bob", 60, 5, 0);
        let mut overlay = BalanceOverlay::new(&base);
        overlay.apply_transfer(&tx, "miner").unwrap();
        base.commit(overlay.into_changes());

        assert_eq!(base.balance_of("alice"), 35);
        assert_eq!(base.balance_of("bob"), 60);
        assert_eq!(base.balance_of("miner"), 5);
        assert_eq!(base.total(), 100);
    }

    #[test]
    fn test_commit_drops_empty_accounts() {
        let mut base = BalanceView::new();
        base.commit(HashMap::from([("alice".to_string(), 10)]));
        base.commit(HashMap::from([("alice".to_string(), 0)]));
        assert_eq!(base.accounts(), 0);
    }
}
