//! Core ledger components
//!
//! - Transactions (account model, signed transfers and block rewards)
//! - Blocks (compact-bits proof of work, merkle commitment)
//! - Difficulty (compact target codec and retargeting)
//! - Balances derived by replaying transactions
//! - Validation (pure transaction and block checks)
//! - Blockchain (the chain plus its derived state)
//! - Ledger (the lock-guarded chain, mempool and persistence hook)

pub mod balance;
pub mod block;
pub mod blockchain;
pub mod difficulty;
pub mod ledger;
pub mod transaction;
pub mod validation;

pub use balance::{BalanceOverlay, BalanceSource, BalanceView};
pub use block::{Block, BlockError, BlockHeader, NonceSearch, BLOCK_VERSION, MAX_BLOCK_TXS};
pub use blockchain::{
    Blockchain, BlockchainError, ChainInfo, ConsensusParams, Replacement, MAX_FUTURE_BLOCK_TIME,
    MEDIAN_TIME_SPAN,
};
pub use difficulty::{DifficultyError, DifficultyState, DEFAULT_BITS, REGTEST_BITS};
pub use ledger::{BlockRef, Ledger, LedgerError, ReplaceError, ReplaceOutcome};
pub use transaction::{Address, Transaction, TransactionError, TransactionKind};
pub use validation::{
    recheck_transaction, validate_block, validate_transaction, BlockEffects, ChainContext,
    TransactionContext,
};
