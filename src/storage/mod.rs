// Storage layer for blockchain and UTXO set

mod blockchain_db;
mod pending;
mod utxo_set;

pub use blockchain_db::{BlockchainDB, ChainIterator};
pub use pending::PendingStore;
pub use utxo_set::{UtxoChanges, UtxoEntry, UtxoSet, UtxoSnapshot};

use crate::consensus::Miner;
use crate::core::{Block, OutPoint, Transaction, TxOutput};
use crate::error::Result;
use parking_lot::{RwLock, RwLockReadGuard};
use std::path::Path;

/// Storage manager - combines blockchain DB, UTXO set and pending transactions
pub struct Storage {
    pub blockchain: BlockchainDB,
    pub utxo_set: UtxoSet,
    pub pending: PendingStore,
}

impl Storage {
    /// Open storage under `path` (`blocks/`, `utxo/` and `pending/` subdirectories)
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let blockchain = BlockchainDB::new(path.as_ref().join("blocks"))?;
        let utxo_set = UtxoSet::new(path.as_ref().join("utxo"))?;
        let pending = PendingStore::new(path.as_ref().join("pending"))?;

        Ok(Self {
            blockchain,
            utxo_set,
            pending,
        })
    }

    /// Create an in-memory storage (for testing)
    pub fn memory() -> Result<Self> {
        let blockchain = BlockchainDB::memory()?;
        let utxo_set = UtxoSet::memory()?;
        let pending = PendingStore::memory()?;

        Ok(Self {
            blockchain,
            utxo_set,
            pending,
        })
    }

    /// Append `block` and fold it into the index. The fold is computed
    /// first so a block the index would reject never reaches the chain.
    fn append(&self, block: &Block) -> Result<()> {
        let changes = self.utxo_set.prepare_update(block)?;
        self.blockchain.append(block)?;
        if let Err(e) = self.utxo_set.commit(changes) {
            log::error!("Block {} appended but UTXO index not updated: {}", block.hash, e);
            return Err(e);
        }
        Ok(())
    }
}

/// Shared ledger: any number of readers, one writer.
/// Appending a block and updating the index happen under the same write lock.
pub struct Ledger {
    storage: RwLock<Storage>,
    miner: Miner,
}

impl Ledger {
    pub fn new(storage: Storage, miner: Miner) -> Self {
        Self {
            storage: RwLock::new(storage),
            miner,
        }
    }

    /// Open the ledger persisted under `path`
    pub fn open<P: AsRef<Path>>(path: P, miner: Miner) -> Result<Self> {
        Ok(Self::new(Storage::new(path)?, miner))
    }

    /// In-memory ledger (for testing)
    pub fn memory(miner: Miner) -> Result<Self> {
        Ok(Self::new(Storage::memory()?, miner))
    }

    pub fn miner(&self) -> &Miner {
        &self.miner
    }

    /// Mine the genesis block around `coinbase` and build the index from it
    pub fn initialize(&self, coinbase: Transaction) -> Result<Block> {
        let storage = self.storage.write();
        let genesis = storage.blockchain.genesis(coinbase, &self.miner)?;
        storage.utxo_set.reindex(&storage.blockchain)?;
        Ok(genesis)
    }

    /// Append a sealed block and update the index
    pub fn append(&self, block: &Block) -> Result<()> {
        self.storage.write().append(block)
    }

    /// Run `check` and the append in one critical section, so the check
    /// sees exactly the state the block is appended to
    pub fn append_with<F>(&self, block: &Block, check: F) -> Result<()>
    where
        F: FnOnce(&Storage) -> Result<()>,
    {
        let storage = self.storage.write();
        check(&storage)?;
        storage.append(block)
    }

    /// Rebuild the index from the chain
    pub fn reindex(&self) -> Result<usize> {
        let storage = self.storage.write();
        storage.utxo_set.reindex(&storage.blockchain)?;
        storage.utxo_set.count_transactions()
    }

    /// Whether the persisted index matches a full replay of the chain
    pub fn verify_index(&self) -> Result<bool> {
        let storage = self.storage.read();
        storage.utxo_set.is_consistent_with(&storage.blockchain)
    }

    /// Shared read access for queries and chain walks
    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read()
    }

    pub fn head(&self) -> Result<Block> {
        self.storage.read().blockchain.head()
    }

    pub fn balance(&self, pubkey_hash: &[u8]) -> Result<u64> {
        self.storage.read().utxo_set.balance(pubkey_hash)
    }

    pub fn find_spendable_outputs(
        &self,
        pubkey_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, Vec<(OutPoint, TxOutput)>)> {
        self.storage.read().utxo_set.find_spendable_outputs(pubkey_hash, amount)
    }

    pub fn count_transactions(&self) -> Result<usize> {
        self.storage.read().utxo_set.count_transactions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    const ALICE: [u8; 20] = [0xa1; 20];

    fn ledger() -> Ledger {
        Ledger::memory(Miner::new(4)).unwrap()
    }

    fn next_block(ledger: &Ledger, to: &[u8]) -> Block {
        let head = ledger.head().unwrap();
        let tx = Transaction::coinbase(to.to_vec(), vec![], 100);
        ledger
            .miner()
            .seal(Block::new(head.hash, vec![tx], head.height + 1), &AtomicBool::new(false))
            .unwrap()
    }

    #[test]
    fn test_initialize_and_balance() {
        let ledger = ledger();
        ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100)).unwrap();

        assert_eq!(ledger.balance(&ALICE).unwrap(), 100);
        assert_eq!(ledger.count_transactions().unwrap(), 1);
        assert!(ledger.verify_index().unwrap());

        let again = ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100));
        assert!(matches!(again, Err(LedgerError::AlreadyInitialized)));
    }

    #[test]
    fn test_append_keeps_index_in_step() {
        let ledger = ledger();
        ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100)).unwrap();

        let block = next_block(&ledger, &ALICE);
        ledger.append(&block).unwrap();

        assert_eq!(ledger.head().unwrap(), block);
        assert_eq!(ledger.balance(&ALICE).unwrap(), 200);
        assert!(ledger.verify_index().unwrap());

        // Appending the same block again changes nothing
        assert!(ledger.append(&block).is_err());
        assert_eq!(ledger.balance(&ALICE).unwrap(), 200);
    }

    #[test]
    fn test_rejected_fold_leaves_chain_untouched() {
        let ledger = ledger();
        let genesis = ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100)).unwrap();

        // Spends an output that does not exist
        let bogus = crate::core::TxInput::new(OutPoint::new(crate::core::Hash256::new([9; 32]), 0), vec![]);
        let tx = Transaction::new(vec![bogus], vec![TxOutput::new(5, ALICE.to_vec())]);
        let block = ledger
            .miner()
            .seal(Block::new(genesis.hash, vec![tx], 1), &AtomicBool::new(false))
            .unwrap();

        assert!(matches!(ledger.append(&block), Err(LedgerError::MissingOutput { .. })));
        assert_eq!(ledger.head().unwrap(), genesis);
        assert!(ledger.verify_index().unwrap());
    }

    #[test]
    fn test_append_with_check_failure() {
        let ledger = ledger();
        let genesis = ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100)).unwrap();
        let block = next_block(&ledger, &ALICE);

        let result = ledger.append_with(&block, |_| Err(LedgerError::Wallet("no".into())));
        assert!(result.is_err());
        assert_eq!(ledger.head().unwrap(), genesis);
    }

    #[test]
    fn test_reindex_restores_index() {
        let ledger = ledger();
        ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100)).unwrap();
        let block = next_block(&ledger, &ALICE);

        // Append to the chain only, bypassing the index
        ledger.read().blockchain.append(&block).unwrap();
        assert!(!ledger.verify_index().unwrap());

        assert_eq!(ledger.reindex().unwrap(), 2);
        assert!(ledger.verify_index().unwrap());
        assert_eq!(ledger.balance(&ALICE).unwrap(), 200);
    }

    #[test]
    fn test_concurrent_readers_during_appends() {
        let ledger = Arc::new(ledger());
        ledger.initialize(Transaction::coinbase(ALICE.to_vec(), vec![], 100)).unwrap();

        let writer = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for _ in 0..5 {
                    let block = next_block(&ledger, &ALICE);
                    ledger.append(&block).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for _ in 0..20 {
                        // Chain and index always agree under one read guard
                        let storage = ledger.read();
                        let blocks = storage.blockchain.block_count().unwrap();
                        let balance = storage.utxo_set.balance(&ALICE).unwrap();
                        assert_eq!(balance, blocks * 100);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(ledger.balance(&ALICE).unwrap(), 600);
    }
}
