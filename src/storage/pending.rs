// Persistent queue of transactions waiting to be mined

use crate::core::{Serializable, Transaction};
use crate::error::{LedgerError, Result};
use sled::Db;
use std::path::Path;

/// Pending transactions kept across restarts, oldest first.
/// Keys are big-endian queue positions.
pub struct PendingStore {
    db: Db,
}

impl PendingStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Create an in-memory store (for testing)
    pub fn memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Stored transactions in queue order
    pub fn load(&self) -> Result<Vec<Transaction>> {
        self.db
            .iter()
            .values()
            .map(|value| {
                let value = value?;
                Transaction::deserialize(&value).map_err(LedgerError::Serialization)
            })
            .collect()
    }

    /// Replace the stored queue with `txs` in one batch
    pub fn save<'a, I>(&self, txs: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let mut batch = sled::Batch::default();
        for key in self.db.iter().keys() {
            batch.remove(key?);
        }
        for (position, tx) in txs.into_iter().enumerate() {
            batch.insert((position as u64).to_be_bytes().to_vec(), tx.serialize());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}
