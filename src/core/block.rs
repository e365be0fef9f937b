// Block data structures

use crate::core::{Hash256, hash256, Transaction, Serializable};
use std::io::{Cursor, Read};
use super::serialize::{write_varint, read_varint, read_hash, read_u64};

/// Block - a proof-of-work sealed batch of transactions linked to its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Proof-of-work digest, zero until sealed
    pub hash: Hash256,
    /// Hash of the previous block, zero for genesis
    pub prev_hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub height: u64,
}

impl Block {
    /// Create an unsealed candidate block
    pub fn new(prev_hash: Hash256, transactions: Vec<Transaction>, height: u64) -> Self {
        Self {
            hash: Hash256::zero(),
            prev_hash,
            transactions,
            nonce: 0,
            height,
        }
    }

    /// Order-sensitive fold over the serialized transactions
    pub fn hash_transactions(transactions: &[Transaction]) -> Hash256 {
        let mut acc = Hash256::zero();
        for tx in transactions {
            let mut data = Vec::with_capacity(32);
            data.extend_from_slice(acc.as_bytes());
            tx.write_to(&mut data);
            acc = hash256(&data);
        }
        acc
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}

impl Serializable for Block {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());

        write_varint(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write_to(&mut buf);
        }

        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor::new(data);
        let decode = |cursor: &mut Cursor<&[u8]>| -> crate::error::Result<Block> {
            let hash = read_hash(cursor)?;
            let prev_hash = read_hash(cursor)?;
            let nonce = read_u64(cursor)?;
            let height = read_u64(cursor)?;

            let tx_count = read_varint(cursor)? as usize;
            let mut transactions = Vec::with_capacity(tx_count.min(1024));
            for _ in 0..tx_count {
                transactions.push(Transaction::read_from(cursor)?);
            }

            Ok(Block { hash, prev_hash, transactions, nonce, height })
        };

        let block = decode(&mut cursor).map_err(|e| e.to_string())?;

        let mut trailing = Vec::new();
        cursor.read_to_end(&mut trailing).map_err(|e| e.to_string())?;
        if !trailing.is_empty() {
            return Err(format!("{} trailing bytes after block", trailing.len()));
        }

        Ok(block)
    }
}
