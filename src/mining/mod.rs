//! Mining module for block creation and transaction pooling

pub mod mempool;
pub mod miner;

pub use mempool::{
    Mempool, MempoolEntry, MempoolError, MempoolStats, SubmitOutcome, DEFAULT_MEMPOOL_SIZE,
};
pub use miner::{IncrementalResult, MineResult, Miner, MiningSnapshot, MiningStats, ResumeState};
