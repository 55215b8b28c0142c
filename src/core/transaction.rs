//! Transactions for the account-based ledger
//!
//! Balances are derived by replaying transactions; there is no UTXO set.
//! A transaction is identified by a digest of every field except its
//! signature, so identical payments collide on purpose and cannot be
//! replayed into the pool or a block twice.

use crate::crypto::{sha256, KeyPair};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque account identity. For transfers this is the sender's hex-encoded
/// compressed public key.
pub type Address = String;

/// Transaction-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("Malformed transaction: {0}")]
    MalformedFields(String),
    #[error("Transaction {0} is already confirmed")]
    AlreadyConfirmed(String),
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Transaction type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Value moved between two accounts, signed by the sender
    Transfer,
    /// Block reward crediting the miner; unsigned, first in every block
    Reward,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Transfer => write!(f, "transfer"),
            TransactionKind::Reward => write!(f, "reward"),
        }
    }
}

/// A ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Digest of all fields except the signature
    pub id: String,
    pub kind: TransactionKind,
    /// Sender identity; empty for rewards
    pub sender: Address,
    pub recipient: Address,
    /// Amount in minor units
    pub amount: u64,
    /// Fee paid to the miner of the including block
    pub fee: u64,
    pub timestamp: DateTime<Utc>,
    /// Caller-chosen discriminator for transfers; the block index for rewards
    pub nonce: u64,
    /// Hex-encoded compact ECDSA signature over the id; empty for rewards
    #[serde(default)]
    pub signature: String,
}

impl Transaction {
    /// Create an unsigned transfer
    pub fn transfer(sender: &str, recipient: &str, amount: u64, fee: u64, nonce: u64) -> Self {
        let mut tx = Self {
            id: String::new(),
            kind: TransactionKind::Transfer,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: Utc::now(),
            nonce,
            signature: String::new(),
        };
        tx.id = tx.calculate_hash();
        tx
    }

    /// Create and sign a transfer from `key_pair`'s account
    pub fn signed_transfer(
        key_pair: &KeyPair,
        recipient: &str,
        amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<Self, TransactionError> {
        let mut tx = Self::transfer(&key_pair.public_key_hex(), recipient, amount, fee, nonce);
        tx.sign(key_pair)?;
        Ok(tx)
    }

    /// Create the reward transaction for the block at `block_index`
    pub fn reward(recipient: &str, amount: u64, block_index: u64, timestamp: DateTime<Utc>) -> Self {
        let mut tx = Self {
            id: String::new(),
            kind: TransactionKind::Reward,
            sender: String::new(),
            recipient: recipient.to_string(),
            amount,
            fee: 0,
            timestamp,
            nonce: block_index,
            signature: String::new(),
        };
        tx.id = tx.calculate_hash();
        tx
    }

    /// Digest of every field except `id` and `signature`
    pub fn calculate_hash(&self) -> String {
        let data = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.kind,
            self.sender,
            self.recipient,
            self.amount,
            self.fee,
            self.timestamp.timestamp_millis(),
            self.nonce
        );
        hex::encode(sha256(data.as_bytes()))
    }

    /// Bytes covered by the signature
    pub fn signing_data(&self) -> Vec<u8> {
        hex::decode(&self.id).unwrap_or_else(|_| sha256(self.id.as_bytes()))
    }

    /// Sign as `key_pair`. Sets the sender to its public key and refreshes the id.
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        self.sender = key_pair.public_key_hex();
        self.id = self.calculate_hash();
        let signature = key_pair
            .sign(&self.signing_data())
            .map_err(|e| TransactionError::Signing(e.to_string()))?;
        self.signature = hex::encode(signature);
        Ok(())
    }

    /// Decoded signature bytes, if the field is valid hex
    pub fn signature_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.signature).ok()
    }

    pub fn is_reward(&self) -> bool {
        self.kind == TransactionKind::Reward
    }

    /// Whether the stored id matches the fields
    pub fn has_valid_id(&self) -> bool {
        self.id == self.calculate_hash()
    }

    /// `amount + fee`, or `None` on overflow
    pub fn total_debit(&self) -> Option<u64> {
        self.amount.checked_add(self.fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Secp256k1Verifier, SignatureVerifier};

    #[test]
    fn test_id_excludes_signature() {
        let kp = KeyPair::generate();
        let mut tx = Transaction::transfer(&kp.public_key_hex(), "bob", 10, 1, 0);
        let before = tx.id.clone();
        tx.sign(&kp).unwrap();
        assert_eq!(tx.id, before);
        assert!(tx.has_valid_id());
    }

    #[test]
    fn test_identical_fields_share_id() {
        let tx1 = Transaction::transfer("alice", "bob", 10, 1, 7);
        let mut tx2 = tx1.clone();
        tx2.signature = "deadbeef".to_string();
        assert_eq!(tx1.id, tx2.calculate_hash());

        tx2.nonce = 8;
        assert_ne!(tx1.id, tx2.calculate_hash());
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let kp = KeyPair::generate();
        let tx = Transaction::signed_transfer(&kp, "bob", 5, 0, 1).unwrap();
        let verifier = Secp256k1Verifier::new();
        assert!(verifier.verify(&tx.sender, &tx.signing_data(), &tx.signature_bytes().unwrap()));
    }

    #[test]
    fn test_tampering_invalidates_id() {
        let mut tx = Transaction::transfer("alice", "bob", 10, 1, 0);
        tx.amount = 1_000;
        assert!(!tx.has_valid_id());
    }

    #[test]
    fn test_reward_shape() {
        let tx = Transaction::reward("miner", 50, 3, Utc::now());
        assert!(tx.is_reward());
        assert!(tx.sender.is_empty());
        assert_eq!(tx.nonce, 3);
        assert_eq!(tx.fee, 0);
    }

    #[test]
    fn test_total_debit_overflow() {
        let tx = Transaction::transfer("a", "b", u64::MAX, 1, 0);
        assert_eq!(tx.total_debit(), None);
    }
}
