//! Chain synchronization
//!
//! Nodes learn about each other through handshakes and discovery claims,
//! and converge by fetching a longer chain from a peer and handing it to
//! [`Ledger::replace_chain`]. Discovery never touches the ledger; only a
//! sync does, and a failed sync leaves it unchanged.

use crate::core::{Ledger, ReplaceError, Transaction};
use crate::network::message::{ChainClaim, Handshake, Message, MIN_PROTOCOL_VERSION};
use crate::network::peer::{PeerId, PeerRegistry};
use crate::network::server::{request, PeerError, Timeouts};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Sync errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Chain rejected: {0}")]
    Rejected(#[from] ReplaceError),
}

/// The address an inbound initiator is registered under: the listen address
/// it advertises, which must be on the host the connection came from. An
/// unspecified host (`0.0.0.0`, `::`) is replaced by the connection's host.
fn advertised_addr(advertised: &str, from: SocketAddr) -> Result<String, String> {
    let addr: SocketAddr = advertised
        .parse()
        .map_err(|_| format!("invalid listen address {}", advertised))?;
    if addr.ip().is_unspecified() {
        return Ok(SocketAddr::new(from.ip(), addr.port()).to_string());
    }
    if addr.ip() != from.ip() {
        return Err(format!(
            "listen address {} does not match connection from {}",
            advertised,
            from.ip()
        ));
    }
    Ok(addr.to_string())
}

/// Result of handling a discovery claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// Nothing to fetch; here are the peers we know
    Peers(Vec<PeerId>),
    /// The claimant has a longer chain and should be synced from
    SyncTriggered { peer: PeerId, claimed_length: u64 },
}

/// Result of a sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synchronized { length: u64 },
    NoChange,
}

/// Handshake, discovery and chain download
pub struct ChainSync {
    ledger: Arc<Ledger>,
    peers: Arc<PeerRegistry>,
    node_id: Uuid,
    listen_addr: String,
    timeouts: Timeouts,
    /// Bound on a whole chain download
    fetch_timeout: Duration,
}

impl ChainSync {
    pub fn new(
        ledger: Arc<Ledger>,
        peers: Arc<PeerRegistry>,
        node_id: Uuid,
        listen_addr: String,
        timeouts: Timeouts,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            peers,
            node_id,
            listen_addr,
            timeouts,
            fetch_timeout,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Our handshake as of now
    pub async fn handshake(&self) -> Handshake {
        let (chain_length, tip_hash) = self.ledger.tip().await;
        Handshake::new(
            self.node_id,
            self.ledger.genesis_hash().to_string(),
            chain_length,
            tip_hash,
            self.listen_addr.clone(),
        )
    }

    /// Our chain claim plus the peers we know
    pub async fn claim(&self) -> ChainClaim {
        let (chain_length, tip_hash) = self.ledger.tip().await;
        ChainClaim {
            from: self.listen_addr.clone(),
            chain_length,
            tip_hash,
            peers: self.peers.known_addresses().await,
        }
    }

    fn check_handshake(&self, theirs: &Handshake) -> Result<(), String> {
        if theirs.version < MIN_PROTOCOL_VERSION {
            return Err(format!(
                "protocol version {} is older than {}",
                theirs.version, MIN_PROTOCOL_VERSION
            ));
        }
        if theirs.node_id == self.node_id {
            return Err("connected to ourselves".to_string());
        }
        if theirs.genesis_hash != self.ledger.genesis_hash() {
            return Err(format!("genesis mismatch: {}", theirs.genesis_hash));
        }
        Ok(())
    }

    /// Handshake with `addr` and register it as Active
    pub async fn connect(&self, addr: &str) -> Result<PeerId, SyncError> {
        if addr == self.listen_addr {
            return Err(SyncError::HandshakeFailed("connected to ourselves".to_string()));
        }
        if !self.peers.begin_handshake(addr).await {
            return Err(SyncError::HandshakeFailed("peer table is full".to_string()));
        }

        let ours = self.handshake().await;
        let reason = match request(addr, Message::Handshake(ours), self.timeouts).await {
            Ok(Message::HandshakeAck(theirs)) => match self.check_handshake(&theirs) {
                Ok(()) => {
                    if self.peers.activate(addr, &theirs).await {
                        return Ok(addr.to_string());
                    }
                    "peer table is full".to_string()
                }
                Err(reason) => reason,
            },
            Ok(other) => format!("unexpected reply {}", other.type_name()),
            Err(e) => e.to_string(),
        };

        log::warn!("Handshake with {} failed: {}", addr, reason);
        self.peers.handshake_failed(addr).await;
        Err(SyncError::HandshakeFailed(reason))
    }

    /// Answer an inbound handshake arriving over a connection from `from`,
    /// registering the initiator on success
    pub async fn accept_handshake(&self, theirs: Handshake, from: SocketAddr) -> Message {
        let checked = self
            .check_handshake(&theirs)
            .and_then(|()| advertised_addr(&theirs.listen_addr, from));
        let addr = match checked {
            Ok(addr) => addr,
            Err(reason) => {
                log::warn!("Refusing handshake from {}: {}", from, reason);
                return Message::Reject(reason);
            }
        };
        if !self.peers.activate(&addr, &theirs).await {
            return Message::Reject("peer table is full".to_string());
        }
        Message::HandshakeAck(self.handshake().await)
    }

    /// Merge a remote claim into the registry and decide whether to sync.
    /// Never modifies the ledger.
    pub async fn discover(&self, claim: ChainClaim) -> DiscoverOutcome {
        self.peers.learn(claim.peers).await;
        let active = self
            .peers
            .refresh(&claim.from, claim.chain_length, &claim.tip_hash)
            .await;

        let ours = self.ledger.chain_length().await;
        if active && claim.chain_length > ours {
            log::info!(
                "Peer {} claims a longer chain ({} > {})",
                claim.from,
                claim.chain_length,
                ours
            );
            return DiscoverOutcome::SyncTriggered {
                peer: claim.from,
                claimed_length: claim.chain_length,
            };
        }
        DiscoverOutcome::Peers(self.peers.known_addresses().await)
    }

    /// Send our claim to `addr` and learn the peers it knows
    pub async fn announce_to(&self, addr: &str) -> Result<bool, SyncError> {
        let claim = self.claim().await;
        match request(addr, Message::Discover(claim), self.timeouts).await? {
            Message::DiscoverReply {
                peers,
                sync_triggered,
            } => {
                self.peers.learn(peers).await;
                Ok(sync_triggered)
            }
            other => Err(PeerError::UnexpectedReply(other.type_name().to_string()).into()),
        }
    }

    /// Announce our claim to every Active peer, returning how many answered
    pub async fn broadcast_claim(&self) -> usize {
        let mut reached = 0;
        for addr in self.peers.active_peers().await {
            match self.announce_to(&addr).await {
                Ok(_) => reached += 1,
                Err(e) => log::debug!("Announcement to {} failed: {}", addr, e),
            }
        }
        reached
    }

    /// Forward a newly accepted transaction to every Active peer
    pub async fn relay_transaction(&self, tx: &Transaction) {
        for addr in self.peers.active_peers().await {
            if let Err(e) = request(&addr, Message::NewTransaction(tx.clone()), self.timeouts).await {
                log::debug!("Relay of {} to {} failed: {}", tx.id, addr, e);
            }
        }
    }

    /// Probe an Active peer and refresh its claim
    pub async fn ping(&self, addr: &str) -> Result<(), SyncError> {
        let nonce: u64 = rand::thread_rng().gen();
        match request(addr, Message::Ping(nonce), self.timeouts).await? {
            Message::Pong {
                nonce: echoed,
                chain_length,
                tip_hash,
            } if echoed == nonce => {
                self.peers.refresh(addr, chain_length, &tip_hash).await;
                Ok(())
            }
            other => Err(PeerError::UnexpectedReply(other.type_name().to_string()).into()),
        }
    }

    /// Download `peer`'s chain and adopt it if it is longer and valid
    pub async fn sync(&self, peer: &str) -> Result<SyncOutcome, SyncError> {
        let timeouts = Timeouts {
            request: self.fetch_timeout,
            ..self.timeouts
        };
        let blocks = match request(peer, Message::GetBlocks { from_index: 0 }, timeouts).await? {
            Message::Blocks(blocks) => blocks,
            other => {
                return Err(PeerError::UnexpectedReply(other.type_name().to_string()).into())
            }
        };

        let tip_hash = blocks.last().map(|b| b.hash.clone()).unwrap_or_default();
        let claimed = blocks.len() as u64;
        match self.ledger.replace_chain(blocks).await {
            Ok(outcome) => {
                self.peers.refresh(peer, claimed, &tip_hash).await;
                log::info!(
                    "Synchronized with {}: length {} (reorg depth {})",
                    peer,
                    outcome.new_length,
                    outcome.reorg_depth
                );
                Ok(SyncOutcome::Synchronized {
                    length: outcome.new_length,
                })
            }
            Err(ReplaceError::NoImprovement { .. }) => Ok(SyncOutcome::NoChange),
            Err(e) => {
                log::warn!("Rejected chain from {}: {}", peer, e);
                Err(e.into())
            }
        }
    }

    /// Sync from the Active peer claiming the longest chain longer than ours
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        let ours = self.ledger.chain_length().await;
        match self.peers.best_peer(ours).await {
            Some((peer, _)) => self.sync(&peer).await,
            None => Ok(SyncOutcome::NoChange),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConsensusParams;
    use crate::crypto::Secp256k1Verifier;
    use crate::network::message::PROTOCOL_VERSION;
    use crate::storage::MemoryStore;

    fn chain_sync() -> ChainSync {
        let ledger = Ledger::open(
            ConsensusParams::regtest(),
            Arc::new(Secp256k1Verifier::new()),
            Arc::new(MemoryStore::new()),
            100,
        )
        .unwrap();
        ChainSync::new(
            Arc::new(ledger),
            Arc::new(PeerRegistry::new("127.0.0.1:1", 16)),
            Uuid::new_v4(),
            "127.0.0.1:1".to_string(),
            Timeouts::default(),
            Duration::from_secs(5),
        )
    }

    fn connection_from(host: &str) -> SocketAddr {
        format!("{}:50000", host).parse().unwrap()
    }

    async fn remote_handshake(sync: &ChainSync, addr: &str, length: u64) -> Handshake {
        let mut theirs = sync.handshake().await;
        theirs.node_id = Uuid::new_v4();
        theirs.listen_addr = addr.to_string();
        theirs.chain_length = length;
        theirs
    }

    #[tokio::test]
    async fn test_accept_handshake_registers_initiator() {
        let sync = chain_sync();
        let theirs = remote_handshake(&sync, "10.0.0.1:9", 1).await;

        let reply = sync.accept_handshake(theirs, connection_from("10.0.0.1")).await;
        assert!(matches!(reply, Message::HandshakeAck(ref ours) if ours.version == PROTOCOL_VERSION));
        assert_eq!(sync.peers.active_peers().await, vec!["10.0.0.1:9".to_string()]);
    }

    #[tokio::test]
    async fn test_accept_handshake_checks_advertised_host() {
        let sync = chain_sync();

        let spoofed = remote_handshake(&sync, "10.0.0.7:9", 1).await;
        assert!(matches!(
            sync.accept_handshake(spoofed, connection_from("10.0.0.1")).await,
            Message::Reject(_)
        ));

        let unparseable = remote_handshake(&sync, "somewhere", 1).await;
        assert!(matches!(
            sync.accept_handshake(unparseable, connection_from("10.0.0.1")).await,
            Message::Reject(_)
        ));
        assert!(sync.peers.is_empty().await);

        let wildcard = remote_handshake(&sync, "0.0.0.0:9", 1).await;
        assert!(matches!(
            sync.accept_handshake(wildcard, connection_from("10.0.0.2")).await,
            Message::HandshakeAck(_)
        ));
        assert_eq!(sync.peers.active_peers().await, vec!["10.0.0.2:9".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_checks() {
        let sync = chain_sync();

        let mut foreign = remote_handshake(&sync, "10.0.0.1:9", 1).await;
        foreign.genesis_hash = "ff".repeat(32);
        assert!(matches!(
            sync.accept_handshake(foreign, connection_from("10.0.0.1")).await,
            Message::Reject(_)
        ));

        let mut old = remote_handshake(&sync, "10.0.0.2:9", 1).await;
        old.version = MIN_PROTOCOL_VERSION - 1;
        assert!(matches!(
            sync.accept_handshake(old, connection_from("10.0.0.2")).await,
            Message::Reject(_)
        ));

        let mut mirror = remote_handshake(&sync, "10.0.0.3:9", 1).await;
        mirror.node_id = sync.node_id();
        assert!(matches!(
            sync.accept_handshake(mirror, connection_from("10.0.0.3")).await,
            Message::Reject(_)
        ));

        assert!(sync.peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_connect_to_self_fails() {
        let sync = chain_sync();
        let result = sync.connect("127.0.0.1:1").await;
        assert!(matches!(result, Err(SyncError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_discover_learns_without_syncing() {
        let sync = chain_sync();
        let before = sync.ledger.tip().await;

        let outcome = sync
            .discover(ChainClaim {
                from: "10.0.0.1:9".into(),
                chain_length: 50,
                tip_hash: "aa".repeat(32),
                peers: vec!["10.0.0.2:9".into()],
            })
            .await;

        // Not Active, so the claim alone does not trigger a sync
        assert_eq!(outcome, DiscoverOutcome::Peers(vec!["10.0.0.2:9".to_string()]));
        assert_eq!(sync.ledger.tip().await, before);
    }

    #[tokio::test]
    async fn test_discover_triggers_sync_for_longer_active_peer() {
        let sync = chain_sync();
        let theirs = remote_handshake(&sync, "10.0.0.1:9", 1).await;
        sync.accept_handshake(theirs, connection_from("10.0.0.1")).await;

        let outcome = sync
            .discover(ChainClaim {
                from: "10.0.0.1:9".into(),
                chain_length: 5,
                tip_hash: "aa".repeat(32),
                peers: vec![],
            })
            .await;
        assert_eq!(
            outcome,
            DiscoverOutcome::SyncTriggered {
                peer: "10.0.0.1:9".into(),
                claimed_length: 5
            }
        );
    }

    #[tokio::test]
    async fn test_sync_now_without_peers() {
        let sync = chain_sync();
        assert_eq!(sync.sync_now().await.unwrap(), SyncOutcome::NoChange);
    }

    #[tokio::test]
    async fn test_sync_from_unreachable_peer_leaves_ledger() {
        let sync = chain_sync();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let before = sync.ledger.tip().await;
        assert!(matches!(sync.sync(&addr).await, Err(SyncError::Peer(_))));
        assert_eq!(sync.ledger.tip().await, before);
    }
}
