//! P2P Networking module
//!
//! Nodes speak a request/response protocol over TCP.
//!
//! # Features
//! - Framed JSON messages with protocol versioning
//! - Handshakes checked against the genesis hash
//! - Peer discovery through chain claims
//! - Longest-chain synchronization
//! - Transaction relay

pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod sync;

pub use message::{
    user_agent, ChainClaim, Handshake, Message, MAGIC, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use node::{
    ConfigError, MineOutcome, MineStep, NetworkStatus, Node, NodeConfig, NodeError, NodeIdentity,
};
pub use peer::{PeerId, PeerInfo, PeerRecord, PeerRegistry, PeerState, MAX_PEERS};
pub use server::{request, serve_connection, MessageCodec, PeerError, Server, Timeouts};
pub use sync::{ChainSync, DiscoverOutcome, SyncError, SyncOutcome};
