// Error types for the ledger core

use crate::consensus::ValidationError;
use crate::core::Hash256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Append whose predecessor is not the current tip
    #[error("chain linkage error: block {block} expects parent {found} at height {height}, tip is {expected}")]
    ChainLinkage {
        block: Hash256,
        expected: Hash256,
        found: Hash256,
        height: u64,
    },

    #[error("blockchain already initialized")]
    AlreadyInitialized,

    #[error("blockchain not initialized")]
    NotInitialized,

    /// A hash linked from the chain is missing from the store
    #[error("corrupt chain: block {0} is referenced but missing")]
    CorruptChain(Hash256),

    #[error("insufficient funds: have {available}, need {requested}")]
    InsufficientFunds { available: u64, requested: u64 },

    #[error("dangling input: output {txid}:{index} does not exist")]
    DanglingInput { txid: Hash256, index: u32 },

    #[error("output {txid}:{index} is not in the UTXO index")]
    MissingOutput { txid: Hash256, index: u32 },

    #[error("transaction {0} already has unspent outputs")]
    DuplicateTransaction(Hash256),

    #[error("block {0} was already applied to the UTXO index")]
    UtxoReplay(Hash256),

    #[error("UTXO index is at {applied}, block {block} builds on {parent}")]
    UtxoOutOfOrder {
        block: Hash256,
        parent: Hash256,
        applied: Hash256,
    },

    #[error("mining cancelled")]
    MiningCancelled,

    #[error("nonce space exhausted at difficulty {0}")]
    NonceSpaceExhausted(u32),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl LedgerError {
    /// Errors after which a node should stop rather than keep serving
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::CorruptChain(_)
                | LedgerError::AlreadyInitialized
                | LedgerError::NonceSpaceExhausted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
