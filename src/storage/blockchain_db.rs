// Blockchain database using sled

use crate::consensus::Miner;
use crate::core::{Block, Hash256, Serializable, Transaction};
use crate::error::{LedgerError, Result};
use sled::Db;
use std::path::Path;
use std::sync::atomic::AtomicBool;

/// Key holding the hash of the current tip
const TIP_KEY: &[u8] = b"lasthash";

/// Append-only, hash-linked block store
pub struct BlockchainDB {
    db: Db,
}

impl BlockchainDB {
    /// Open (or create) a blockchain database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Get a block by hash
    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        match self.db.get(Self::block_key(hash))? {
            Some(data) => {
                let block = Block::deserialize(&data).map_err(LedgerError::Serialization)?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Get block hash from the height index
    pub fn get_hash_by_height(&self, height: u64) -> Result<Option<Hash256>> {
        match self.db.get(Self::height_key(height))? {
            Some(data) => Ok(Some(Self::decode_hash(&data)?)),
            None => Ok(None),
        }
    }

    /// Get block by height
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.get_hash_by_height(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    /// Hash of the chain tip, `None` before genesis
    pub fn tip_hash(&self) -> Result<Option<Hash256>> {
        match self.db.get(TIP_KEY)? {
            Some(data) => Ok(Some(Self::decode_hash(&data)?)),
            None => Ok(None),
        }
    }

    /// The tip block
    pub fn head(&self) -> Result<Block> {
        let tip = self.tip_hash()?.ok_or(LedgerError::NotInitialized)?;
        self.get_block(&tip)?.ok_or(LedgerError::CorruptChain(tip))
    }

    /// Check if a block exists
    pub fn has_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.db.contains_key(Self::block_key(hash))?)
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.tip_hash()?.is_some())
    }

    /// Append a sealed block on top of the current tip.
    /// The block, its height entry and the new tip pointer are written in one batch.
    pub fn append(&self, block: &Block) -> Result<()> {
        let (expected_parent, expected_height) = match self.tip_hash()? {
            Some(tip) => {
                let head = self.get_block(&tip)?.ok_or(LedgerError::CorruptChain(tip))?;
                (tip, head.height + 1)
            }
            None => (Hash256::zero(), 0),
        };

        if block.prev_hash != expected_parent || block.height != expected_height {
            return Err(LedgerError::ChainLinkage {
                block: block.hash,
                expected: expected_parent,
                found: block.prev_hash,
                height: block.height,
            });
        }

        let mut batch = sled::Batch::default();
        batch.insert(Self::block_key(&block.hash), block.serialize());
        batch.insert(Self::height_key(block.height), block.hash.as_bytes().to_vec());
        batch.insert(TIP_KEY, block.hash.as_bytes().to_vec());
        self.db.apply_batch(batch)?;
        self.db.flush()?;

        log::debug!("Appended block {} at height {}", block.hash, block.height);
        Ok(())
    }

    /// Mine and append the first block, holding only `coinbase`
    pub fn genesis(&self, coinbase: Transaction, miner: &Miner) -> Result<Block> {
        if self.is_initialized()? {
            return Err(LedgerError::AlreadyInitialized);
        }

        let candidate = Block::new(Hash256::zero(), vec![coinbase], 0);
        let block = miner.seal(candidate, &AtomicBool::new(false))?;
        self.append(&block)?;

        log::info!("Genesis block created: {}", block.hash);
        Ok(block)
    }

    /// Walk from the tip back to genesis
    pub fn iter(&self) -> Result<ChainIterator<'_>> {
        Ok(ChainIterator {
            db: self,
            next: self.tip_hash()?,
        })
    }

    /// Number of blocks in the chain
    pub fn block_count(&self) -> Result<u64> {
        match self.tip_hash()? {
            Some(_) => Ok(self.head()?.height + 1),
            None => Ok(0),
        }
    }

    fn decode_hash(data: &[u8]) -> Result<Hash256> {
        Hash256::from_slice(data).map_err(LedgerError::Serialization)
    }

    // Helper: create key for block storage
    fn block_key(hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b'b'); // 'b' for block
        key.extend_from_slice(hash.as_bytes());
        key
    }

    // Helper: create key for height index
    fn height_key(height: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(b'h'); // 'h' for height
        key.extend_from_slice(&height.to_be_bytes());
        key
    }
}

/// Lazy tip-to-genesis walk following `prev_hash` links
pub struct ChainIterator<'a> {
    db: &'a BlockchainDB,
    next: Option<Hash256>,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        match self.db.get_block(&hash) {
            Ok(Some(block)) => {
                if !block.is_genesis() {
                    self.next = Some(block.prev_hash);
                }
                Some(Ok(block))
            }
            Ok(None) => Some(Err(LedgerError::CorruptChain(hash))),
            Err(e) => Some(Err(e)),
        }
    }
}
