//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing
//! - secp256k1 signing and the signature verification capability
//! - Merkle root calculation

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, double_sha256_hex, is_hex_digest, sha256, sha256_hex, ZERO_HASH};
pub use keys::{public_key_from_hex, KeyError, KeyPair, Secp256k1Verifier, SignatureVerifier};
pub use merkle::{calculate_merkle_root, merkle_root_of_ids};
