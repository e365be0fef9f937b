// Consensus and validation logic

pub mod pow;
pub mod validation;

pub use pow::{Miner, Target, MiningResult, compute_hash, DEFAULT_DIFFICULTY, MAX_DIFFICULTY};
pub use validation::{BlockValidator, TransactionValidator, ValidationError};
