//! Network message types for P2P communication
//!
//! Every exchange is a single request frame answered by a single reply frame.

use crate::core::{Block, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version we talk to
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = *b"PWLG";

/// Maximum encoded message size (32 MiB)
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Opening message of a connection attempt
    Handshake(Handshake),

    /// The remote side accepted our handshake and sends its own
    HandshakeAck(Handshake),

    /// Advertise our chain and known peers
    Discover(ChainClaim),

    /// Answer to `Discover`: the replier's known peers, and whether our
    /// claim made it start a sync
    DiscoverReply {
        peers: Vec<String>,
        sync_triggered: bool,
    },

    /// Request blocks from an index to the tip
    GetBlocks { from_index: u64 },

    /// Response with requested blocks
    Blocks(Vec<Block>),

    /// Liveness probe
    Ping(u64),

    /// Liveness answer carrying a fresh chain claim
    Pong {
        nonce: u64,
        chain_length: u64,
        tip_hash: String,
    },

    /// Relay a pending transaction
    NewTransaction(Transaction),

    /// Generic acknowledgement
    Ack,

    /// The request was refused
    Reject(String),
}

/// Handshake message for initial connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version
    pub version: u32,
    /// Random per-process identity; detects connections to ourselves
    pub node_id: Uuid,
    pub genesis_hash: String,
    pub chain_length: u64,
    pub tip_hash: String,
    /// Address the sender accepts connections on
    pub listen_addr: String,
    /// Node's user agent string
    pub user_agent: String,
}

impl Handshake {
    /// Create a new handshake message
    pub fn new(
        node_id: Uuid,
        genesis_hash: String,
        chain_length: u64,
        tip_hash: String,
        listen_addr: String,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            node_id,
            genesis_hash,
            chain_length,
            tip_hash,
            listen_addr,
            user_agent: user_agent(),
        }
    }
}

/// User agent advertised in handshakes
pub fn user_agent() -> String {
    format!("pow-ledger/{}", env!("CARGO_PKG_VERSION"))
}

/// A node's statement about its chain, plus the peers it knows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainClaim {
    /// Listen address of the claimant
    pub from: String,
    pub chain_length: u64,
    pub tip_hash: String,
    pub peers: Vec<String>,
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "Handshake",
            Message::HandshakeAck(_) => "HandshakeAck",
            Message::Discover(_) => "Discover",
            Message::DiscoverReply { .. } => "DiscoverReply",
            Message::GetBlocks { .. } => "GetBlocks",
            Message::Blocks(_) => "Blocks",
            Message::Ping(_) => "Ping",
            Message::Pong { .. } => "Pong",
            Message::NewTransaction(_) => "NewTransaction",
            Message::Ack => "Ack",
            Message::Reject(_) => "Reject",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Pong {
            nonce: 12345,
            chain_length: 7,
            tip_hash: "ab".repeat(32),
        };
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_handshake() {
        let id = Uuid::new_v4();
        let handshake = Handshake::new(id, "g".into(), 100, "abc123".into(), "127.0.0.1:9000".into());
        assert_eq!(handshake.version, PROTOCOL_VERSION);
        assert_eq!(handshake.node_id, id);
        assert!(handshake.user_agent.starts_with("pow-ledger/"));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Message::GetBlocks { from_index: 0 }.type_name(), "GetBlocks");
        assert_eq!(Message::Reject("no".into()).type_name(), "Reject");
    }
}
