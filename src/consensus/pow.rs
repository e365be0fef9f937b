// Proof of Work implementation

use crate::core::{Block, Hash256, hash256};
use crate::error::{LedgerError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Difficulty used when the configuration does not set one
pub const DEFAULT_DIFFICULTY: u32 = 12;

/// Hashes are 256 bits wide, so a difficulty must leave at least one bit free
pub const MAX_DIFFICULTY: u32 = 255;

/// Difficulty target: a digest is valid when it has at least
/// `difficulty` leading zero bits, i.e. it is below 2^(256 - difficulty)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub difficulty: u32,
}

impl Target {
    pub fn new(difficulty: u32) -> Self {
        Self { difficulty }
    }

    /// Check if a hash meets this target
    #[inline]
    pub fn is_valid_hash(&self, hash: &Hash256) -> bool {
        hash.leading_zero_bits() >= self.difficulty
    }

    /// Expected number of attempts to find a valid hash
    pub fn expected_attempts(&self) -> f64 {
        2f64.powi(self.difficulty as i32)
    }
}

/// Block identity: hash256(prev_hash || tx_summary || nonce as big-endian u64)
pub fn compute_hash(prev_hash: &Hash256, tx_summary: &Hash256, nonce: u64) -> Hash256 {
    let mut data = Vec::with_capacity(72);
    data.extend_from_slice(prev_hash.as_bytes());
    data.extend_from_slice(tx_summary.as_bytes());
    data.extend_from_slice(&nonce.to_be_bytes());
    hash256(&data)
}

/// Proof of Work miner
#[derive(Debug, Clone, Copy)]
pub struct Miner {
    /// Fixed difficulty target
    pub target: Target,
}

impl Miner {
    /// Create a new miner with fixed difficulty
    pub fn new(difficulty: u32) -> Self {
        Self {
            target: Target::new(difficulty),
        }
    }

    /// Search nonces from 0 upward until the block's hash meets the target.
    /// `cancel` is polled every attempt; setting it abandons the search.
    pub fn mine(&self, block: &Block, cancel: &AtomicBool) -> Result<MiningResult> {
        let start_time = Instant::now();
        let tx_summary = Block::hash_transactions(&block.transactions);
        let mut attempts = 0u64;
        log::debug!(
            "Searching nonces at difficulty {} (~{:.0} attempts expected)",
            self.target.difficulty,
            self.target.expected_attempts()
        );

        for nonce in 0..=u64::MAX {
            if cancel.load(Ordering::Relaxed) {
                log::debug!("Mining cancelled after {} attempts", attempts);
                return Err(LedgerError::MiningCancelled);
            }

            let hash = compute_hash(&block.prev_hash, &tx_summary, nonce);
            attempts = attempts.saturating_add(1);

            if self.target.is_valid_hash(&hash) {
                return Ok(MiningResult {
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                });
            }

            // Progress indicator every 100k attempts
            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!("Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        Err(LedgerError::NonceSpaceExhausted(self.target.difficulty))
    }

    /// Mine `block` and store the winning nonce and hash in it
    pub fn seal(&self, mut block: Block, cancel: &AtomicBool) -> Result<Block> {
        let result = self.mine(&block, cancel)?;
        log::info!(
            "Mined block {} at height {} in {} attempts ({:.1} H/s)",
            result.hash,
            block.height,
            result.attempts,
            result.hash_rate()
        );
        block.nonce = result.nonce;
        block.hash = result.hash;
        Ok(block)
    }

    /// Recompute the hash with the stored nonce and check it; no search
    pub fn verify(&self, block: &Block) -> bool {
        let tx_summary = Block::hash_transactions(&block.transactions);
        let hash = compute_hash(&block.prev_hash, &tx_summary, block.nonce);
        hash == block.hash && self.target.is_valid_hash(&hash)
    }
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    pub nonce: u64,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}
