//! Peer registry
//!
//! The registry is the only owner of peer records. A peer moves
//! `Unknown -> Handshaking -> Active`, and drops to `Stale` when a handshake
//! fails or it goes quiet for longer than the peer timeout. Stale peers may
//! be retried later.

use crate::network::message::Handshake;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default maximum number of tracked peers
pub const MAX_PEERS: usize = 32;

/// Peers are identified by the address they accept connections on
pub type PeerId = String;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// Heard of, never contacted
    Unknown,
    Handshaking,
    Active,
    /// Handshake failed or the peer went quiet
    Stale,
}

/// Everything we know about one peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub addr: PeerId,
    pub node_id: Option<Uuid>,
    pub state: PeerState,
    /// Chain length the peer last claimed
    pub claimed_length: u64,
    pub tip_hash: String,
    pub last_seen: Option<Instant>,
    pub user_agent: String,
}

impl PeerRecord {
    fn new(addr: PeerId) -> Self {
        Self {
            addr,
            node_id: None,
            state: PeerState::Unknown,
            claimed_length: 0,
            tip_hash: String::new(),
            last_seen: None,
            user_agent: String::new(),
        }
    }

    /// Not heard from within `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.map_or(true, |seen| seen.elapsed() > timeout)
    }
}

/// Serializable view of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub addr: PeerId,
    pub node_id: Option<Uuid>,
    pub state: PeerState,
    pub claimed_length: u64,
    pub tip_hash: String,
    pub last_seen_secs: Option<u64>,
    pub user_agent: String,
}

impl From<&PeerRecord> for PeerInfo {
    fn from(record: &PeerRecord) -> Self {
        Self {
            addr: record.addr.clone(),
            node_id: record.node_id,
            state: record.state,
            claimed_length: record.claimed_length,
            tip_hash: record.tip_hash.clone(),
            last_seen_secs: record.last_seen.map(|seen| seen.elapsed().as_secs()),
            user_agent: record.user_agent.clone(),
        }
    }
}

/// Tracks every known peer and its state
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    /// Our own listen address, never registered
    self_addr: PeerId,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(self_addr: impl Into<PeerId>, max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            self_addr: self_addr.into(),
            max_peers,
        }
    }

    fn admissible(&self, addr: &str) -> bool {
        !addr.is_empty() && addr != self.self_addr
    }

    /// Make room for one more record by dropping a peer that is not Active
    fn make_room(&self, peers: &mut HashMap<PeerId, PeerRecord>) -> bool {
        if peers.len() < self.max_peers {
            return true;
        }
        let victim = peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Stale | PeerState::Unknown))
            .min_by_key(|p| (p.state == PeerState::Unknown, p.last_seen))
            .map(|p| p.addr.clone());
        match victim {
            Some(addr) => {
                peers.remove(&addr);
                true
            }
            None => false,
        }
    }

    /// Record addresses heard about from other peers. Returns how many were new.
    pub async fn learn<I>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut peers = self.peers.write().await;
        let mut added = 0;
        for addr in addrs {
            if !self.admissible(&addr) || peers.contains_key(&addr) {
                continue;
            }
            if peers.len() >= self.max_peers {
                break;
            }
            peers.insert(addr.clone(), PeerRecord::new(addr));
            added += 1;
        }
        if added > 0 {
            log::debug!("Learned {} new peer addresses", added);
        }
        added
    }

    /// Mark `addr` as being contacted. False if it cannot be tracked.
    pub async fn begin_handshake(&self, addr: &str) -> bool {
        if !self.admissible(addr) {
            return false;
        }
        let mut peers = self.peers.write().await;
        if !peers.contains_key(addr) {
            if !self.make_room(&mut peers) {
                return false;
            }
            peers.insert(addr.to_string(), PeerRecord::new(addr.to_string()));
        }
        if let Some(peer) = peers.get_mut(addr) {
            if peer.state != PeerState::Active {
                peer.state = PeerState::Handshaking;
            }
        }
        true
    }

    /// Record a completed handshake. False if the registry is full of
    /// active peers.
    pub async fn activate(&self, addr: &str, handshake: &Handshake) -> bool {
        if !self.admissible(addr) {
            return false;
        }
        let mut peers = self.peers.write().await;
        if !peers.contains_key(addr) && !self.make_room(&mut peers) {
            return false;
        }

        let peer = peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerRecord::new(addr.to_string()));
        let was_active = peer.state == PeerState::Active;
        peer.state = PeerState::Active;
        peer.node_id = Some(handshake.node_id);
        peer.claimed_length = handshake.chain_length;
        peer.tip_hash = handshake.tip_hash.clone();
        peer.user_agent = handshake.user_agent.clone();
        peer.last_seen = Some(Instant::now());

        if !was_active {
            log::info!(
                "Peer {} active ({}, chain length {})",
                addr,
                handshake.user_agent,
                handshake.chain_length
            );
        }
        true
    }

    pub async fn handshake_failed(&self, addr: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.state = PeerState::Stale;
        }
    }

    /// Record a fresh claim from an Active peer. False if the peer is not
    /// Active.
    pub async fn refresh(&self, addr: &str, claimed_length: u64, tip_hash: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(addr) {
            Some(peer) if peer.state == PeerState::Active => {
                peer.claimed_length = claimed_length;
                peer.tip_hash = tip_hash.to_string();
                peer.last_seen = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Demote Active peers not heard from within `timeout`. Returns them.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<PeerId> {
        let mut peers = self.peers.write().await;
        let mut evicted = Vec::new();
        for peer in peers.values_mut() {
            if peer.state == PeerState::Active && peer.is_stale(timeout) {
                peer.state = PeerState::Stale;
                evicted.push(peer.addr.clone());
            }
        }
        for addr in &evicted {
            log::info!("Peer {} went stale", addr);
        }
        evicted
    }

    /// Active peer with the longest claimed chain, if longer than `min_length`
    pub async fn best_peer(&self, min_length: u64) -> Option<(PeerId, u64)> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Active && p.claimed_length > min_length)
            .max_by_key(|p| p.claimed_length)
            .map(|p| (p.addr.clone(), p.claimed_length))
    }

    pub async fn active_peers(&self) -> Vec<PeerId> {
        self.addresses_in(&[PeerState::Active]).await
    }

    /// Addresses worth a connection attempt, at most `limit`
    pub async fn connect_candidates(&self, limit: usize) -> Vec<PeerId> {
        let mut addrs = self
            .addresses_in(&[PeerState::Unknown, PeerState::Stale])
            .await;
        addrs.truncate(limit);
        addrs
    }

    /// Every address except stale ones, for sharing with other peers
    pub async fn known_addresses(&self) -> Vec<PeerId> {
        self.addresses_in(&[PeerState::Unknown, PeerState::Handshaking, PeerState::Active])
            .await
    }

    async fn addresses_in(&self, states: &[PeerState]) -> Vec<PeerId> {
        let mut addrs: Vec<PeerId> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| states.contains(&p.state))
            .map(|p| p.addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    pub async fn get(&self, addr: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(addr).cloned()
    }

    pub async fn state(&self, addr: &str) -> Option<PeerState> {
        self.peers.read().await.get(addr).map(|p| p.state)
    }

    pub async fn infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.read().await.values().map(PeerInfo::from).collect();
        infos.sort_by(|a, b| a.addr.cmp(&b.addr));
        infos
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
