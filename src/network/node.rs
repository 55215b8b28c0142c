//! P2P Node implementation
//!
//! The node wires the ledger, the peer registry and the sync protocol to a
//! TCP server, runs periodic maintenance, and exposes the operations an
//! outer surface (CLI, RPC) needs.

use crate::core::{
    Block, BlockRef, ChainInfo, ConsensusParams, Ledger, LedgerError, Transaction,
};
use crate::crypto::Secp256k1Verifier;
use crate::mining::{
    IncrementalResult, MineResult, Miner, ResumeState, SubmitOutcome, DEFAULT_MEMPOOL_SIZE,
};
use crate::network::message::{user_agent, ChainClaim, Message};
use crate::network::peer::{PeerId, PeerInfo, PeerRegistry, MAX_PEERS};
use crate::network::server::{serve_connection, Server, Timeouts};
use crate::network::sync::{ChainSync, DiscoverOutcome, SyncError, SyncOutcome};
use crate::storage::ChainStore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Unknown addresses tried per maintenance round
const CONNECT_ATTEMPTS_PER_ROUND: usize = 3;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// P2P Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to listen on; port 0 picks a free port
    pub listen_addr: String,
    /// Initial peers to connect to
    pub bootstrap_peers: Vec<String>,
    /// Data directory for chain storage
    pub data_dir: PathBuf,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Bound on downloading a whole chain
    pub fetch_timeout_ms: u64,
    /// Active peers not heard from for this long become Stale
    pub peer_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
    pub max_peers: usize,
    pub mempool_capacity: usize,
    /// Mempool transactions a locally mined block may include
    pub max_block_transactions: usize,
    pub consensus: ConsensusParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8333".to_string(),
            bootstrap_peers: Vec::new(),
            data_dir: PathBuf::from(".ledger_data"),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            fetch_timeout_ms: 60_000,
            peer_timeout_secs: 120,
            maintenance_interval_secs: 15,
            max_peers: MAX_PEERS,
            mempool_capacity: DEFAULT_MEMPOOL_SIZE,
            max_block_transactions: 1_000,
            consensus: ConsensusParams::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file; missing keys take their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            request: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Result of `mine_once`
#[derive(Debug, Clone)]
pub enum MineOutcome {
    Found(Block),
    Exhausted { last_nonce: u64, elapsed: Duration },
    /// A block was found but the tip moved before it could be appended
    Stale,
}

/// Result of `mine_step`
#[derive(Debug, Clone)]
pub enum MineStep {
    Found(Block),
    Continue(ResumeState),
    Stale,
}

/// Who this node is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: Uuid,
    pub listen_addr: String,
    pub user_agent: String,
    pub genesis_hash: String,
}

/// Snapshot of the node's network view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub identity: NodeIdentity,
    pub peers: Vec<PeerInfo>,
    pub uptime_secs: u64,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    ledger: Arc<Ledger>,
    peers: Arc<PeerRegistry>,
    sync: Arc<ChainSync>,
    listen_addr: String,
    node_id: Uuid,
    started: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Open the ledger, start serving and maintaining, and connect to the
    /// bootstrap peers
    pub async fn launch(config: NodeConfig, store: Arc<dyn ChainStore>) -> Result<Arc<Self>, NodeError> {
        let ledger = Arc::new(Ledger::open(
            config.consensus,
            Arc::new(Secp256k1Verifier::new()),
            store,
            config.mempool_capacity,
        )?);

        let server = Server::bind(&config.listen_addr).await?;
        let listen_addr = server.local_addr().to_string();
        let node_id = Uuid::new_v4();

        let peers = Arc::new(PeerRegistry::new(listen_addr.clone(), config.max_peers));
        let sync = Arc::new(ChainSync::new(
            Arc::clone(&ledger),
            Arc::clone(&peers),
            node_id,
            listen_addr.clone(),
            config.timeouts(),
            Duration::from_millis(config.fetch_timeout_ms),
        ));

        let node = Arc::new(Self {
            config,
            ledger,
            peers,
            sync,
            listen_addr,
            node_id,
            started: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        });

        let idle = Duration::from_millis(node.config.request_timeout_ms).max(Duration::from_secs(30));
        let accept = tokio::spawn(Self::accept_loop(Arc::downgrade(&node), server, idle));
        let maintenance = tokio::spawn(Self::maintenance_loop(
            Arc::downgrade(&node),
            Duration::from_secs(node.config.maintenance_interval_secs.max(1)),
        ));
        if let Ok(mut tasks) = node.tasks.lock() {
            tasks.push(accept);
            tasks.push(maintenance);
        }

        log::info!("Node {} listening on {}", node.node_id, node.listen_addr);

        for addr in node.config.bootstrap_peers.clone() {
            if let Err(e) = node.connect_peer(&addr).await {
                log::warn!("Bootstrap peer {} unavailable: {}", addr, e);
            }
        }
        if let Err(e) = node.sync_now().await {
            log::warn!("Initial sync failed: {}", e);
        }

        Ok(node)
    }

    async fn accept_loop(node: Weak<Node>, server: Server, idle: Duration) {
        loop {
            let (stream, addr) = match server.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let Some(node) = node.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                serve_connection(stream, addr, idle, |msg| {
                    let node = Arc::clone(&node);
                    async move { node.handle_message(msg, addr).await }
                })
                .await;
            });
        }
    }

    async fn maintenance_loop(node: Weak<Node>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(node) = node.upgrade() else {
                break;
            };
            node.maintain().await;
        }
    }

    /// One round of peer upkeep followed by a sync attempt
    pub async fn maintain(&self) {
        for addr in self.peers.active_peers().await {
            if let Err(e) = self.sync.ping(&addr).await {
                log::debug!("Ping to {} failed: {}", addr, e);
            }
        }

        let timeout = Duration::from_secs(self.config.peer_timeout_secs);
        self.peers.evict_stale(timeout).await;

        for addr in self.peers.connect_candidates(CONNECT_ATTEMPTS_PER_ROUND).await {
            if let Err(e) = self.sync.connect(&addr).await {
                log::debug!("Connection to {} failed: {}", addr, e);
            }
        }

        for addr in self.peers.active_peers().await {
            if let Err(e) = self.sync.announce_to(&addr).await {
                log::debug!("Announcement to {} failed: {}", addr, e);
            }
        }

        if let Err(e) = self.sync_now().await {
            log::warn!("Sync failed: {}", e);
        }
    }

    /// Answer one inbound request received over a connection from `from`
    pub async fn handle_message(&self, msg: Message, from: SocketAddr) -> Message {
        match msg {
            Message::Handshake(theirs) => self.sync.accept_handshake(theirs, from).await,
            Message::Discover(claim) => match self.sync.discover(claim).await {
                DiscoverOutcome::Peers(peers) => Message::DiscoverReply {
                    peers,
                    sync_triggered: false,
                },
                DiscoverOutcome::SyncTriggered { peer, .. } => {
                    let sync = Arc::clone(&self.sync);
                    tokio::spawn(async move {
                        match sync.sync(&peer).await {
                            Ok(SyncOutcome::Synchronized { .. }) => {
                                sync.broadcast_claim().await;
                            }
                            Ok(SyncOutcome::NoChange) => {}
                            Err(e) => log::warn!("Sync with {} failed: {}", peer, e),
                        }
                    });
                    Message::DiscoverReply {
                        peers: self.peers.known_addresses().await,
                        sync_triggered: true,
                    }
                }
            },
            Message::GetBlocks { from_index } => {
                Message::Blocks(self.ledger.blocks_from(from_index).await)
            }
            Message::Ping(nonce) => {
                let (chain_length, tip_hash) = self.ledger.tip().await;
                Message::Pong {
                    nonce,
                    chain_length,
                    tip_hash,
                }
            }
            Message::NewTransaction(tx) => match self.submit_transaction(tx).await {
                Ok(_) => Message::Ack,
                Err(e) => Message::Reject(e.to_string()),
            },
            other => Message::Reject(format!("unexpected {}", other.type_name())),
        }
    }

    fn spawn_announcement(&self) {
        let sync = Arc::clone(&self.sync);
        tokio::spawn(async move {
            sync.broadcast_claim().await;
        });
    }

    // =========================================================================
    // External interface
    // =========================================================================

    /// Validate and pool a transaction, relaying it to peers when new
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<SubmitOutcome, LedgerError> {
        let outcome = self.ledger.submit_transaction(tx.clone()).await?;
        if outcome == SubmitOutcome::Accepted {
            let sync = Arc::clone(&self.sync);
            tokio::spawn(async move {
                sync.relay_transaction(&tx).await;
            });
        }
        Ok(outcome)
    }

    pub async fn mempool(&self) -> Vec<Transaction> {
        self.ledger.mempool_transactions().await
    }

    pub async fn chain_info(&self) -> ChainInfo {
        self.ledger.chain_info().await
    }

    pub async fn block(&self, reference: &BlockRef) -> Option<Block> {
        self.ledger.block(reference).await
    }

    pub async fn balance(&self, address: &str) -> u64 {
        self.ledger.balance(address).await
    }

    async fn append_mined(&self, block: Block) -> bool {
        match self.ledger.append_block(block).await {
            Ok(()) => {
                self.spawn_announcement();
                true
            }
            Err(e) if e.is_stale() => {
                log::info!("Mined block went stale: {}", e);
                false
            }
            Err(e) => {
                log::warn!("Mined block rejected: {}", e);
                false
            }
        }
    }

    /// Build a candidate on the current tip and search up to `max_attempts`
    /// nonces. No lock is held while hashing.
    pub async fn mine_once(&self, max_attempts: u64, miner_address: &str) -> Result<MineOutcome, NodeError> {
        let snapshot = self
            .ledger
            .mining_snapshot(self.config.max_block_transactions)
            .await;
        let miner = Miner::new(miner_address);
        let candidate = miner.build_candidate(&snapshot);

        let result =
            tokio::task::spawn_blocking(move || miner.mine_synchronous(candidate, max_attempts)).await?;

        Ok(match result {
            MineResult::Found(block, _) => {
                if self.append_mined(block.clone()).await {
                    MineOutcome::Found(block)
                } else {
                    MineOutcome::Stale
                }
            }
            MineResult::Exhausted {
                last_nonce,
                elapsed,
            } => MineOutcome::Exhausted {
                last_nonce,
                elapsed,
            },
        })
    }

    /// Continue (or start) a resumable search. A resume state built on an
    /// old tip, or for another reward address, is dropped and a fresh
    /// candidate is used instead.
    pub async fn mine_step(
        &self,
        max_attempts: u64,
        miner_address: &str,
        resume: Option<ResumeState>,
    ) -> Result<MineStep, NodeError> {
        let tip_hash = self.ledger.tip_hash().await;
        let miner = Miner::new(miner_address);

        let usable = resume.filter(|state| {
            let current = state.tip_hash() == tip_hash
                && state
                    .candidate
                    .reward_tx()
                    .map_or(false, |tx| tx.recipient == miner_address);
            if !current {
                log::debug!("Discarding stale mining state for block {}", state.candidate.index);
            }
            current
        });
        let state = match usable {
            Some(state) => state,
            None => {
                let snapshot = self
                    .ledger
                    .mining_snapshot(self.config.max_block_transactions)
                    .await;
                ResumeState::new(miner.build_candidate(&snapshot))
            }
        };

        let result =
            tokio::task::spawn_blocking(move || miner.mine_incremental(state, max_attempts)).await?;

        Ok(match result {
            IncrementalResult::Found(block, _) => {
                if self.append_mined(block.clone()).await {
                    MineStep::Found(block)
                } else {
                    MineStep::Stale
                }
            }
            IncrementalResult::Continue(state) => MineStep::Continue(state),
        })
    }

    pub async fn network_status(&self) -> NetworkStatus {
        NetworkStatus {
            identity: self.identity(),
            peers: self.peers.infos().await,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node_id,
            listen_addr: self.listen_addr.clone(),
            user_agent: user_agent(),
            genesis_hash: self.ledger.genesis_hash().to_string(),
        }
    }

    /// Handshake with `addr`; both sides register each other
    pub async fn connect_peer(&self, addr: &str) -> Result<PeerId, SyncError> {
        self.sync.connect(addr).await
    }

    /// Merge a remote claim; never modifies the ledger
    pub async fn discover(&self, claim: ChainClaim) -> DiscoverOutcome {
        self.sync.discover(claim).await
    }

    /// Sync from the best Active peer, announcing our new tip on success
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        let outcome = self.sync.sync_now().await?;
        if let SyncOutcome::Synchronized { .. } = outcome {
            self.spawn_announcement();
        }
        Ok(outcome)
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stop accepting connections and stop maintenance
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        log::info!("Node {} stopped", self.node_id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::network::peer::PeerState;
    use crate::storage::MemoryStore;
    use std::io::Write;

    fn test_config() -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            connect_timeout_ms: 1_000,
            request_timeout_ms: 2_000,
            fetch_timeout_ms: 5_000,
            maintenance_interval_secs: 3_600,
            consensus: ConsensusParams::regtest(),
            ..NodeConfig::default()
        }
    }

    async fn launch() -> Arc<Node> {
        Node::launch(test_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap()
    }

    async fn mine_block(node: &Node, miner: &str) -> Block {
        match node.mine_once(1_000_000, miner).await.unwrap() {
            MineOutcome::Found(block) => block,
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[test]
    fn test_config_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen_addr = \"127.0.0.1:9100\"\nbootstrap_peers = [\"127.0.0.1:9101\"]\n\n[consensus]\nblock_reward = 25"
        )
        .unwrap();

        let config = NodeConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9100");
        assert_eq!(config.bootstrap_peers, vec!["127.0.0.1:9101".to_string()]);
        assert_eq!(config.consensus.block_reward, 25);
        assert_eq!(config.consensus.max_supply, ConsensusParams::default().max_supply);
        assert_eq!(config.max_peers, MAX_PEERS);
    }

    #[tokio::test]
    async fn test_mine_once_zero_attempts() {
        let node = launch().await;
        let outcome = node.mine_once(0, "miner").await.unwrap();
        assert!(matches!(outcome, MineOutcome::Exhausted { .. }));
        assert_eq!(node.chain_info().await.length, 1);
    }

    #[tokio::test]
    async fn test_mine_once_and_lookup() {
        let node = launch().await;
        let block = mine_block(&node, "miner").await;

        assert_eq!(node.chain_info().await.length, 2);
        assert_eq!(node.balance("miner").await, 50);
        assert_eq!(node.block(&BlockRef::Index(1)).await, Some(block.clone()));
        assert_eq!(
            node.block(&BlockRef::Hash(block.hash.clone())).await,
            Some(block)
        );
        assert_eq!(node.block(&BlockRef::Index(9)).await, None);
    }

    #[tokio::test]
    async fn test_mine_step_discards_stale_state() {
        let node = launch().await;

        let state = match node.mine_step(0, "miner", None).await.unwrap() {
            MineStep::Continue(state) => state,
            other => panic!("expected Continue, got {:?}", other),
        };
        assert_eq!(state.candidate.index, 1);

        mine_block(&node, "other").await;

        match node.mine_step(1_000_000, "miner", Some(state)).await.unwrap() {
            MineStep::Found(block) => {
                assert_eq!(block.index, 2);
                assert_eq!(block.reward_tx().unwrap().recipient, "miner");
            }
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mine_step_resumes() {
        let node = launch().await;
        let mut resume = None;
        let block = loop {
            match node.mine_step(1, "miner", resume.take()).await.unwrap() {
                MineStep::Found(block) => break block,
                MineStep::Continue(state) => resume = Some(state),
                MineStep::Stale => panic!("no competing miner"),
            }
        };
        assert_eq!(block.index, 1);
        assert_eq!(node.chain_info().await.length, 2);
    }

    #[tokio::test]
    async fn test_handle_ping_and_get_blocks() {
        let node = launch().await;
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        mine_block(&node, "miner").await;

        match node.handle_message(Message::Ping(9), client).await {
            Message::Pong {
                nonce,
                chain_length,
                ..
            } => {
                assert_eq!(nonce, 9);
                assert_eq!(chain_length, 2);
            }
            other => panic!("expected Pong, got {:?}", other),
        }

        match node
            .handle_message(Message::GetBlocks { from_index: 1 }, client)
            .await
        {
            Message::Blocks(blocks) => assert_eq!(blocks.len(), 1),
            other => panic!("expected Blocks, got {:?}", other),
        }

        assert!(matches!(
            node.handle_message(Message::Ack, client).await,
            Message::Reject(_)
        ));
    }

    #[tokio::test]
    async fn test_two_nodes_converge() {
        let a = launch().await;
        let b = launch().await;
        mine_block(&a, "miner_a").await;

        let peer = b.connect_peer(a.listen_addr()).await.unwrap();
        assert_eq!(peer, a.listen_addr());
        assert_eq!(
            a.peers.state(b.listen_addr()).await,
            Some(PeerState::Active)
        );

        assert_eq!(
            b.sync_now().await.unwrap(),
            SyncOutcome::Synchronized { length: 2 }
        );
        assert_eq!(b.chain_info().await.tip_hash, a.chain_info().await.tip_hash);
        assert_eq!(b.sync_now().await.unwrap(), SyncOutcome::NoChange);
    }

    #[tokio::test]
    async fn test_competing_blocks_over_tcp() {
        let alice = KeyPair::generate();
        let a = launch().await;
        let b = launch().await;

        let shared = mine_block(&a, &alice.public_key_hex()).await;
        b.ledger().append_block(shared).await.unwrap();

        // Unconnected, B extends the shared chain twice while A confirms
        // alice's payment
        mine_block(&b, "miner_b").await;
        mine_block(&b, "miner_b").await;

        let tx = Transaction::signed_transfer(&alice, "bob", 10, 1, 0).unwrap();
        assert_eq!(
            a.submit_transaction(tx.clone()).await.unwrap(),
            SubmitOutcome::Accepted
        );
        let mined = mine_block(&a, "miner_a").await;
        assert!(mined.transactions.iter().any(|t| t.id == tx.id));

        a.connect_peer(b.listen_addr()).await.unwrap();
        assert_eq!(
            a.sync_now().await.unwrap(),
            SyncOutcome::Synchronized { length: 4 }
        );

        let info_a = a.chain_info().await;
        assert_eq!(info_a.length, 4);
        assert_eq!(info_a.tip_hash, b.chain_info().await.tip_hash);
        assert_eq!(a.balance("bob").await, 0);
        assert!(a.mempool().await.iter().any(|t| t.id == tx.id));
    }

    #[tokio::test]
    async fn test_transaction_relayed_to_peer() {
        let alice = KeyPair::generate();
        let a = launch().await;
        let b = launch().await;
        mine_block(&a, &alice.public_key_hex()).await;
        b.connect_peer(a.listen_addr()).await.unwrap();
        b.sync_now().await.unwrap();

        let tx = Transaction::signed_transfer(&alice, "bob", 5, 1, 0).unwrap();
        a.submit_transaction(tx.clone()).await.unwrap();

        let mut relayed = false;
        for _ in 0..50 {
            if b.ledger().knows_transaction(&tx.id).await {
                relayed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(relayed);
    }

    #[tokio::test]
    async fn test_maintain_refreshes_and_syncs() {
        let a = launch().await;
        let b = launch().await;
        b.connect_peer(a.listen_addr()).await.unwrap();

        let block = mine_block(&a, "miner_a").await;
        b.maintain().await;

        assert_eq!(b.chain_info().await.tip_hash, block.hash);
    }

    #[tokio::test]
    async fn test_network_status() {
        let node = launch().await;
        let status = node.network_status().await;
        assert_eq!(status.identity.listen_addr, node.listen_addr());
        assert!(status.peers.is_empty());
        node.shutdown();
    }
}
