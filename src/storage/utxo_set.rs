// UTXO (Unspent Transaction Output) index

use crate::core::{Block, Hash256, OutPoint, TxOutput, read_varint, read_u32, write_varint};
use crate::error::{LedgerError, Result};
use crate::storage::BlockchainDB;
use sled::Db;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io::Cursor;
use std::path::Path;

/// Prefix of per-transaction entry keys
const ENTRY_PREFIX: u8 = b'u';

/// Key holding the hash of the last block folded into the index
const LAST_APPLIED_KEY: &[u8] = b"lastapplied";

/// Unspent outputs of one transaction, by output index
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UtxoEntry {
    pub outputs: BTreeMap<u32, TxOutput>,
}

impl UtxoEntry {
    fn from_outputs(outputs: &[TxOutput]) -> Self {
        Self {
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(index, output)| (index as u32, output.clone()))
                .collect(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, self.outputs.len() as u64);
        for (index, output) in &self.outputs {
            bytes.extend_from_slice(&index.to_le_bytes());
            output.write_to(&mut bytes);
        }
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = read_varint(&mut cursor)?;
        let mut outputs = BTreeMap::new();
        for _ in 0..count {
            let index = read_u32(&mut cursor)?;
            outputs.insert(index, TxOutput::read_from(&mut cursor)?);
        }
        Ok(Self { outputs })
    }
}

/// Full contents of the index, ordered by transaction id
pub type UtxoSnapshot = BTreeMap<Hash256, UtxoEntry>;

/// Pending writes produced by folding blocks into the index
#[derive(Debug)]
pub struct UtxoChanges {
    /// `None` deletes the entry
    entries: BTreeMap<Hash256, Option<UtxoEntry>>,
    last_applied: Option<Hash256>,
    /// Drop every existing entry first (full reindex)
    replace_all: bool,
}

/// Applies blocks over an optional persisted base, caching touched entries
struct Fold<'a> {
    base: Option<&'a UtxoSet>,
    entries: BTreeMap<Hash256, Option<UtxoEntry>>,
}

impl<'a> Fold<'a> {
    fn new(base: Option<&'a UtxoSet>) -> Self {
        Self {
            base,
            entries: BTreeMap::new(),
        }
    }

    fn slot(&mut self, txid: &Hash256) -> Result<&mut Option<UtxoEntry>> {
        match self.entries.entry(*txid) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let loaded = match self.base {
                    Some(set) => set.get_entry(txid)?,
                    None => None,
                };
                Ok(slot.insert(loaded))
            }
        }
    }

    /// Per transaction in block order: remove what it spends, then add its outputs
    fn apply(&mut self, block: &Block) -> Result<()> {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let slot = self.slot(&input.prev_txid)?;
                    let removed = slot
                        .as_mut()
                        .and_then(|entry| entry.outputs.remove(&input.prev_index));
                    if removed.is_none() {
                        return Err(LedgerError::MissingOutput {
                            txid: input.prev_txid,
                            index: input.prev_index,
                        });
                    }
                    if slot.as_ref().is_some_and(|entry| entry.outputs.is_empty()) {
                        *slot = None;
                    }
                }
            }

            if tx.outputs.is_empty() {
                continue;
            }
            let slot = self.slot(&tx.id)?;
            if slot.is_some() {
                return Err(LedgerError::DuplicateTransaction(tx.id));
            }
            *slot = Some(UtxoEntry::from_outputs(&tx.outputs));
        }
        Ok(())
    }
}

/// UTXO index database
pub struct UtxoSet {
    db: Db,
}

impl UtxoSet {
    /// Open (or create) the index at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Create an in-memory UTXO set (for testing)
    pub fn memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get_entry(&self, txid: &Hash256) -> Result<Option<UtxoEntry>> {
        match self.db.get(Self::entry_key(txid))? {
            Some(data) => Ok(Some(UtxoEntry::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Look up a single unspent output
    pub fn find_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>> {
        Ok(self
            .get_entry(&outpoint.txid)?
            .and_then(|mut entry| entry.outputs.remove(&outpoint.index)))
    }

    /// Whether `txid` still has at least one unspent output
    pub fn contains_transaction(&self, txid: &Hash256) -> Result<bool> {
        Ok(self.db.contains_key(Self::entry_key(txid))?)
    }

    /// Hash of the last block folded into the index
    pub fn last_applied(&self) -> Result<Option<Hash256>> {
        match self.db.get(LAST_APPLIED_KEY)? {
            Some(data) => Ok(Some(Hash256::from_slice(&data).map_err(LedgerError::Serialization)?)),
            None => Ok(None),
        }
    }

    /// Entries in key order (transaction id, then output index)
    fn entries(&self) -> impl Iterator<Item = Result<(Hash256, UtxoEntry)>> + '_ {
        self.db.scan_prefix([ENTRY_PREFIX]).map(|item| {
            let (key, value) = item?;
            let txid = Hash256::from_slice(&key[1..]).map_err(LedgerError::Serialization)?;
            Ok((txid, UtxoEntry::from_bytes(&value)?))
        })
    }

    /// Collect outputs locked to `pubkey_hash` until they cover `amount`.
    /// Returns whatever was gathered; the caller checks `total >= amount`.
    pub fn find_spendable_outputs(
        &self,
        pubkey_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, Vec<(OutPoint, TxOutput)>)> {
        let mut accumulated = 0u64;
        let mut selected = Vec::new();

        'scan: for item in self.entries() {
            let (txid, entry) = item?;
            for (index, output) in entry.outputs {
                if accumulated >= amount {
                    break 'scan;
                }
                if output.is_locked_with_key(pubkey_hash) {
                    accumulated = accumulated.saturating_add(output.value);
                    selected.push((OutPoint::new(txid, index), output));
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// Get all UTXOs locked to `pubkey_hash`
    pub fn find_utxos(&self, pubkey_hash: &[u8]) -> Result<Vec<(OutPoint, TxOutput)>> {
        let mut utxos = Vec::new();
        for item in self.entries() {
            let (txid, entry) = item?;
            for (index, output) in entry.outputs {
                if output.is_locked_with_key(pubkey_hash) {
                    utxos.push((OutPoint::new(txid, index), output));
                }
            }
        }
        Ok(utxos)
    }

    /// Sum of all unspent outputs locked to `pubkey_hash`, saturating at `u64::MAX`
    pub fn balance(&self, pubkey_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxos(pubkey_hash)?
            .iter()
            .fold(0u64, |acc, (_, output)| acc.saturating_add(output.value)))
    }

    /// Number of transactions with at least one unspent output
    pub fn count_transactions(&self) -> Result<usize> {
        Ok(self.db.scan_prefix([ENTRY_PREFIX]).count())
    }

    /// Compute the writes for folding `block` in, without touching the store.
    /// Rejects a block already applied or one that does not extend the last applied block.
    pub fn prepare_update(&self, block: &Block) -> Result<UtxoChanges> {
        let applied = self.last_applied()?;
        if applied == Some(block.hash) {
            return Err(LedgerError::UtxoReplay(block.hash));
        }
        let applied = applied.unwrap_or_else(Hash256::zero);
        if block.prev_hash != applied {
            return Err(LedgerError::UtxoOutOfOrder {
                block: block.hash,
                parent: block.prev_hash,
                applied,
            });
        }

        let mut fold = Fold::new(Some(self));
        fold.apply(block)?;

        Ok(UtxoChanges {
            entries: fold.entries,
            last_applied: Some(block.hash),
            replace_all: false,
        })
    }

    /// Write prepared changes in one atomic batch
    pub fn commit(&self, changes: UtxoChanges) -> Result<()> {
        let mut batch = sled::Batch::default();

        if changes.replace_all {
            for key in self.db.scan_prefix([ENTRY_PREFIX]).keys() {
                batch.remove(key?);
            }
        }

        for (txid, entry) in &changes.entries {
            match entry {
                Some(entry) => batch.insert(Self::entry_key(txid), entry.to_bytes()),
                None => batch.remove(Self::entry_key(txid)),
            }
        }

        match changes.last_applied {
            Some(hash) => batch.insert(LAST_APPLIED_KEY, hash.as_bytes().to_vec()),
            None => batch.remove(LAST_APPLIED_KEY),
        }

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    /// Incrementally fold one newly appended block into the index
    pub fn update(&self, block: &Block) -> Result<()> {
        let changes = self.prepare_update(block)?;
        self.commit(changes)?;
        log::debug!("UTXO index updated to block {}", block.hash);
        Ok(())
    }

    /// Replay the whole chain from genesis into a fresh in-memory index
    pub fn rebuild(chain: &BlockchainDB) -> Result<UtxoSnapshot> {
        Ok(Self::fold_chain(chain)?
            .into_iter()
            .filter_map(|(txid, entry)| entry.map(|entry| (txid, entry)))
            .collect())
    }

    fn fold_chain(chain: &BlockchainDB) -> Result<BTreeMap<Hash256, Option<UtxoEntry>>> {
        // The store only walks backwards, so collect the hashes first
        let mut hashes = Vec::new();
        for block in chain.iter()? {
            hashes.push(block?.hash);
        }

        let mut fold = Fold::new(None);
        for hash in hashes.iter().rev() {
            let block = chain.get_block(hash)?.ok_or(LedgerError::CorruptChain(*hash))?;
            fold.apply(&block)?;
        }
        Ok(fold.entries)
    }

    /// Discard the index and rebuild it from the chain
    pub fn reindex(&self, chain: &BlockchainDB) -> Result<()> {
        let entries = Self::fold_chain(chain)?;
        let changes = UtxoChanges {
            entries,
            last_applied: chain.tip_hash()?,
            replace_all: true,
        };
        self.commit(changes)?;
        log::info!("UTXO index rebuilt: {} transactions", self.count_transactions()?);
        Ok(())
    }

    /// Current persisted contents
    pub fn snapshot(&self) -> Result<UtxoSnapshot> {
        self.entries().collect()
    }

    /// Compare the persisted index against a full replay of `chain`
    pub fn is_consistent_with(&self, chain: &BlockchainDB) -> Result<bool> {
        let rebuilt = Self::rebuild(chain)?;
        let consistent = rebuilt == self.snapshot()? && self.last_applied()? == chain.tip_hash()?;
        if !consistent {
            log::warn!("UTXO index diverged from the chain");
        }
        Ok(consistent)
    }

    fn entry_key(txid: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(ENTRY_PREFIX);
        key.extend_from_slice(txid.as_bytes());
        key
    }
}
