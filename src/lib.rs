// Proof-of-work UTXO ledger
// Hash-linked block store, UTXO index, signed transfers and a cancelable miner

pub mod core;
pub mod consensus;
pub mod storage;
pub mod network;
pub mod wallet;
pub mod config;
pub mod error;
pub mod cli;

// Re-exports for convenience
pub use core::{Block, Hash256, OutPoint, Transaction, TxInput, TxOutput};
pub use consensus::{BlockValidator, Miner, Target, ValidationError};
pub use storage::{BlockchainDB, Ledger, Storage, UtxoSet};
pub use network::{Broadcaster, MinerHandle, Node};
pub use config::Config;
pub use error::{LedgerError, Result};
pub use cli::{Cli, CliHandler};
