//! Proof-of-work chain: transactions, blocks, fork choice and the mining loop

pub mod block;
pub mod coordinator;
pub mod ledger;
pub mod miner;
pub mod pool;
pub mod transaction;

pub use block::{Block, BlockType};
pub use coordinator::{ChainCommand, ChainCoordinator, SharedChain};
pub use ledger::{BlockOutcome, Blockchain, ChainSummary};
pub use transaction::Transaction;
