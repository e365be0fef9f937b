// Transaction data structures, signing and verification

use crate::core::{Hash256, hash256, pubkey_hash, Serializable, Signer, Verifier};
use crate::error::{LedgerError, Result};
use std::fmt;
use std::io::{Cursor, Read};
use super::serialize::{write_varint, read_varint, write_var_bytes, read_var_bytes, read_hash, read_u32, read_u64};

/// Output index carried by a coinbase input: "no prior output"
pub const COINBASE_INDEX: u32 = u32::MAX;

/// Random payload length used when a coinbase is created without data
const COINBASE_DATA_LEN: usize = 24;

/// Reference to one output of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Id of the transaction holding the spent output
    pub prev_txid: Hash256,
    /// Index of the output in that transaction
    pub prev_index: u32,
    /// Signature over this input's signing digest
    pub signature: Vec<u8>,
    /// Spender's public key (arbitrary data for a coinbase)
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Create an unsigned input spending `outpoint`
    pub fn new(outpoint: OutPoint, pub_key: Vec<u8>) -> Self {
        Self {
            prev_txid: outpoint.txid,
            prev_index: outpoint.index,
            signature: Vec::new(),
            pub_key,
        }
    }

    /// Create a coinbase input carrying `data`
    pub fn coinbase(data: Vec<u8>) -> Self {
        Self {
            prev_txid: Hash256::zero(),
            prev_index: COINBASE_INDEX,
            signature: Vec::new(),
            pub_key: data,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_zero() && self.prev_index == COINBASE_INDEX
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prev_txid, self.prev_index)
    }

    /// Whether this input's public key hashes to `pubkey_hash`
    pub fn uses_key(&self, pubkey_hash_bytes: &[u8]) -> bool {
        pubkey_hash(&self.pub_key) == pubkey_hash_bytes
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.prev_txid.as_bytes());
        buf.extend_from_slice(&self.prev_index.to_le_bytes());
        write_var_bytes(buf, &self.signature);
        write_var_bytes(buf, &self.pub_key);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            prev_txid: read_hash(reader)?,
            prev_index: read_u32(reader)?,
            signature: read_var_bytes(reader)?,
            pub_key: read_var_bytes(reader)?,
        })
    }
}

/// Transaction output - an amount locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub pubkey_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, pubkey_hash: Vec<u8>) -> Self {
        Self { value, pubkey_hash }
    }

    pub fn is_locked_with_key(&self, pubkey_hash: &[u8]) -> bool {
        self.pubkey_hash == pubkey_hash
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(buf, &self.pubkey_hash);
    }

    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            value: read_u64(reader)?,
            pubkey_hash: read_var_bytes(reader)?,
        })
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Hash of inputs and outputs with signatures blanked
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a transaction and compute its id
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: Hash256::zero(),
            inputs,
            outputs,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Create a coinbase transaction minting `reward` to `to_pubkey_hash`.
    /// Empty `data` is replaced with random bytes so ids never repeat.
    pub fn coinbase(to_pubkey_hash: Vec<u8>, data: Vec<u8>, reward: u64) -> Self {
        let data = if data.is_empty() {
            rand::random::<[u8; COINBASE_DATA_LEN]>().to_vec()
        } else {
            data
        };
        Self::new(
            vec![TxInput::coinbase(data)],
            vec![TxOutput::new(reward, to_pubkey_hash)],
        )
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Hash of the serialized inputs and outputs with every signature blanked.
    /// Stable across signing.
    pub fn compute_id(&self) -> Hash256 {
        let mut buf = Vec::new();
        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            let blanked = TxInput {
                signature: Vec::new(),
                ..input.clone()
            };
            blanked.write_to(&mut buf);
        }
        self.write_outputs(&mut buf);
        hash256(&buf)
    }

    /// Sum of the output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Copy with every signature and public key cleared
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_txid: input.prev_txid,
                prev_index: input.prev_index,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();
        Transaction {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Digest signed by input `index`: the trimmed copy with only that
    /// input's key slot holding the lock of the output it spends.
    fn signing_digest(trimmed: &mut Transaction, index: usize, prev_pubkey_hash: &[u8]) -> Hash256 {
        trimmed.inputs[index].pub_key = prev_pubkey_hash.to_vec();
        let digest = trimmed.compute_id();
        trimmed.inputs[index].pub_key = Vec::new();
        digest
    }

    /// Sign every input with `signer`. `lookup` resolves the outputs being spent.
    pub fn sign<F>(&mut self, signer: &dyn Signer, mut lookup: F) -> Result<()>
    where
        F: FnMut(&OutPoint) -> Result<Option<TxOutput>>,
    {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut trimmed = self.trimmed_copy();
        for index in 0..self.inputs.len() {
            let outpoint = self.inputs[index].outpoint();
            let prev = lookup(&outpoint)?.ok_or(LedgerError::DanglingInput {
                txid: outpoint.txid,
                index: outpoint.index,
            })?;

            let digest = Self::signing_digest(&mut trimmed, index, &prev.pubkey_hash);
            self.inputs[index].signature = signer.sign(&digest)?;
        }

        Ok(())
    }

    /// Check every input's signature and key against the output it spends.
    /// A missing prior output is an error; a bad signature is `Ok(false)`.
    pub fn verify<F>(&self, verifier: &dyn Verifier, mut lookup: F) -> Result<bool>
    where
        F: FnMut(&OutPoint) -> Result<Option<TxOutput>>,
    {
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut trimmed = self.trimmed_copy();
        for (index, input) in self.inputs.iter().enumerate() {
            let outpoint = input.outpoint();
            let prev = lookup(&outpoint)?.ok_or(LedgerError::DanglingInput {
                txid: outpoint.txid,
                index: outpoint.index,
            })?;

            if !input.uses_key(&prev.pubkey_hash) {
                log::debug!("tx {} input {} does not own {}", self.id, index, outpoint);
                return Ok(false);
            }

            let digest = Self::signing_digest(&mut trimmed, index, &prev.pubkey_hash);
            if !verifier.verify(&digest, &input.signature, &input.pub_key) {
                log::debug!("tx {} input {} has a bad signature", self.id, index);
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn write_outputs(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_to(buf);
        }
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());
        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_to(buf);
        }
        self.write_outputs(buf);
    }

    /// Deserialize from a reader (used when decoding a whole block)
    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let id = read_hash(reader)?;

        let input_count = read_varint(reader)? as usize;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput::read_from(reader)?);
        }

        let output_count = read_varint(reader)? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput::read_from(reader)?);
        }

        Ok(Self { id, inputs, outputs })
    }
}

impl Serializable for Transaction {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    fn deserialize(data: &[u8]) -> std::result::Result<Self, String> {
        let mut cursor = Cursor::new(data);
        Self::read_from(&mut cursor).map_err(|e| e.to_string())
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.id)?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:     {}", input.prev_txid)?;
            writeln!(f, "       Out:      {}", input.prev_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       PubKeyHash: {}", hex::encode(&output.pubkey_hash))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{KeyPair, Secp256k1Verifier};
    use std::collections::HashMap;

    fn funded(owner: &KeyPair, value: u64) -> Transaction {
        Transaction::coinbase(owner.pubkey_hash(), b"funding".to_vec(), value)
    }

    fn spend(owner: &KeyPair, prev: &Transaction, to: Vec<u8>) -> Transaction {
        let input = TxInput::new(OutPoint::new(prev.id, 0), owner.pubkey_bytes());
        let value = prev.outputs[0].value;
        Transaction::new(vec![input], vec![TxOutput::new(value, to)])
    }

    fn lookup_in(txs: &[&Transaction]) -> impl FnMut(&OutPoint) -> Result<Option<TxOutput>> {
        let map: HashMap<Hash256, Transaction> =
            txs.iter().map(|tx| (tx.id, (*tx).clone())).collect();
        move |outpoint| {
            Ok(map
                .get(&outpoint.txid)
                .and_then(|tx| tx.outputs.get(outpoint.index as usize).cloned()))
        }
    }

    #[test]
    fn test_coinbase_input() {
        let input = TxInput::coinbase(vec![1, 2, 3]);
        assert!(input.is_coinbase());
        assert_eq!(input.prev_txid, Hash256::zero());
        assert_eq!(input.prev_index, COINBASE_INDEX);
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::coinbase(vec![7; 20], vec![], 100);

        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.inputs[0].pub_key.len(), COINBASE_DATA_LEN);

        // Random data keeps coinbase ids apart
        let other = Transaction::coinbase(vec![7; 20], vec![], 100);
        assert_ne!(tx.id, other.id);
    }

    #[test]
    fn test_transaction_serialization() {
        let tx = Transaction::coinbase(vec![4, 5, 6], vec![1, 2, 3], 5000);

        let serialized = tx.serialize();
        let deserialized = Transaction::deserialize(&serialized).unwrap();

        assert_eq!(tx, deserialized);
    }

    #[test]
    fn test_id_is_stable_across_signing() {
        let alice = KeyPair::generate();
        let prev = funded(&alice, 50);
        let mut tx = spend(&alice, &prev, vec![9; 20]);
        let id = tx.id;

        tx.sign(&alice, lookup_in(&[&prev])).unwrap();

        assert!(!tx.inputs[0].signature.is_empty());
        assert_eq!(tx.compute_id(), id);
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = KeyPair::generate();
        let prev = funded(&alice, 50);
        let mut tx = spend(&alice, &prev, vec![9; 20]);
        tx.sign(&alice, lookup_in(&[&prev])).unwrap();

        assert!(tx.verify(&Secp256k1Verifier::new(), lookup_in(&[&prev])).unwrap());
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let alice = KeyPair::generate();
        let prev = funded(&alice, 50);
        let mut tx = spend(&alice, &prev, vec![9; 20]);
        tx.sign(&alice, lookup_in(&[&prev])).unwrap();

        let verifier = Secp256k1Verifier::new();
        for i in 0..tx.inputs[0].signature.len() {
            let mut tampered = tx.clone();
            tampered.inputs[0].signature[i] ^= 0x01;
            assert!(!tampered.verify(&verifier, lookup_in(&[&prev])).unwrap());
        }
    }

    #[test]
    fn test_verify_rejects_wrong_owner() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let prev = funded(&alice, 50);

        // Mallory signs a spend of Alice's output with her own key
        let mut tx = spend(&mallory, &prev, mallory.pubkey_hash());
        tx.sign(&mallory, lookup_in(&[&prev])).unwrap();

        assert!(!tx.verify(&Secp256k1Verifier::new(), lookup_in(&[&prev])).unwrap());
    }

    #[test]
    fn test_signature_is_bound_to_its_input() {
        let alice = KeyPair::generate();
        let first = funded(&alice, 30);
        let second = funded(&alice, 70);

        let inputs = vec![
            TxInput::new(OutPoint::new(first.id, 0), alice.pubkey_bytes()),
            TxInput::new(OutPoint::new(second.id, 0), alice.pubkey_bytes()),
        ];
        let mut tx = Transaction::new(inputs, vec![TxOutput::new(100, vec![9; 20])]);
        tx.sign(&alice, lookup_in(&[&first, &second])).unwrap();

        // Replaying input 0's signature on input 1 must not verify
        let mut replayed = tx.clone();
        replayed.inputs[1].signature = tx.inputs[0].signature.clone();
        assert!(!replayed.verify(&Secp256k1Verifier::new(), lookup_in(&[&first, &second])).unwrap());
    }

    #[test]
    fn test_verify_dangling_input() {
        let alice = KeyPair::generate();
        let prev = funded(&alice, 50);
        let mut tx = spend(&alice, &prev, vec![9; 20]);
        tx.sign(&alice, lookup_in(&[&prev])).unwrap();

        let result = tx.verify(&Secp256k1Verifier::new(), lookup_in(&[]));
        assert!(matches!(result, Err(LedgerError::DanglingInput { index: 0, .. })));
    }

    #[test]
    fn test_coinbase_verifies_without_lookup() {
        let tx = Transaction::coinbase(vec![1; 20], vec![], 100);
        assert!(tx.verify(&Secp256k1Verifier::new(), lookup_in(&[])).unwrap());
    }
}
