//! ECDSA keys and signature verification
//!
//! The ledger only needs to *verify* signatures; it consumes that capability
//! through [`SignatureVerifier`]. [`KeyPair`] is the secp256k1 signer used by
//! wallets, tests and the CLI.

use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::sha256;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Signature verification capability consumed by the validation engine.
///
/// `public_key` is the sender identity as it appears on transactions.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &str, message: &[u8], signature: &[u8]) -> bool;
}

/// secp256k1 ECDSA verifier over compact signatures and hex-encoded
/// compressed public keys.
pub struct Secp256k1Verifier {
    secp: Secp256k1<secp256k1::VerifyOnly>,
}

impl Secp256k1Verifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }
}

impl Default for Secp256k1Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureVerifier for Secp256k1Verifier {
    fn verify(&self, public_key: &str, message: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = public_key_from_hex(public_key) else {
            return false;
        };
        let Ok(sig) = Signature::from_compact(signature) else {
            return false;
        };
        let Ok(message) = Message::from_digest_slice(&digest32(message)) else {
            return false;
        };
        self.secp.verify_ecdsa(&message, &sig, &public_key).is_ok()
    }
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        let public_key = PublicKey::from_secret_key(&Secp256k1::new(), &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed public key as hex. This is the account identity on the ledger.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Sign a message, returning the 64-byte compact signature
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let message = Message::from_digest_slice(&digest32(message))?;
        let signature = Secp256k1::new().sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact().to_vec())
    }
}

/// Parse a public key from hex string
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)
}

// ECDSA signs 32-byte digests; longer or shorter messages are hashed first.
fn digest32(message: &[u8]) -> Vec<u8> {
    if message.len() == 32 {
        message.to_vec()
    } else {
        sha256(message)
    }
}
