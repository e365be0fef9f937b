// Transaction builder

use crate::core::{OutPoint, Signer, Transaction, TxInput, TxOutput, pubkey_hash};
use crate::error::{LedgerError, Result};
use crate::storage::UtxoSet;
use crate::wallet::Address;
use std::collections::HashMap;

/// Builds signed transfers funded from the UTXO index
pub struct TransactionBuilder<'a> {
    utxo_set: &'a UtxoSet,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(utxo_set: &'a UtxoSet) -> Self {
        Self { utxo_set }
    }

    /// Pay `amount` to `to` from outputs locked to the signer's key.
    /// Any surplus goes back to the sender as change.
    pub fn build(&self, signer: &dyn Signer, to: &Address, amount: u64) -> Result<Transaction> {
        if amount == 0 {
            return Err(LedgerError::Wallet("amount must be positive".to_string()));
        }

        let sender_key = signer.public_key();
        let sender_hash = pubkey_hash(&sender_key);
        let recipient_hash = to.to_pubkey_hash()?;

        let (total_input, selected) = self.utxo_set.find_spendable_outputs(&sender_hash, amount)?;
        if total_input < amount {
            return Err(LedgerError::InsufficientFunds {
                available: total_input,
                requested: amount,
            });
        }

        // Inputs carry the public key now so the id does not change on signing
        let inputs: Vec<TxInput> = selected
            .iter()
            .map(|(outpoint, _)| TxInput::new(*outpoint, sender_key.clone()))
            .collect();

        let mut outputs = vec![TxOutput::new(amount, recipient_hash)];
        let change = total_input - amount;
        if change > 0 {
            outputs.push(TxOutput::new(change, sender_hash));
        }

        let mut tx = Transaction::new(inputs, outputs);

        let spent: HashMap<OutPoint, TxOutput> = selected.into_iter().collect();
        tx.sign(signer, |outpoint| Ok(spent.get(outpoint).cloned()))?;

        log::debug!("Built transaction {} paying {} to {}", tx.id, amount, to);
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Miner;
    use crate::core::Block;
    use crate::storage::BlockchainDB;
    use crate::wallet::{KeyPair, Secp256k1Verifier};
    use std::sync::atomic::AtomicBool;

    /// Chain whose genesis pays each of `grants` to its key
    fn funded(grants: &[(&KeyPair, u64)]) -> (BlockchainDB, UtxoSet) {
        let chain = BlockchainDB::memory().unwrap();
        let utxo_set = UtxoSet::memory().unwrap();
        let txs = grants
            .iter()
            .map(|(kp, value)| Transaction::coinbase(kp.pubkey_hash(), vec![], *value))
            .collect();
        let block = Miner::new(4)
            .seal(Block::new(crate::core::Hash256::zero(), txs, 0), &AtomicBool::new(false))
            .unwrap();
        chain.append(&block).unwrap();
        utxo_set.reindex(&chain).unwrap();
        (chain, utxo_set)
    }

    #[test]
    fn test_transaction_builder() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_chain, utxo_set) = funded(&[(&alice, 100)]);

        let tx = TransactionBuilder::new(&utxo_set)
            .build(&alice, &bob.address(), 30)
            .unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2); // Payment + change
        assert_eq!(tx.outputs[0], TxOutput::new(30, bob.pubkey_hash()));
        assert_eq!(tx.outputs[1], TxOutput::new(70, alice.pubkey_hash()));

        let verified = tx
            .verify(&Secp256k1Verifier::new(), |outpoint| utxo_set.find_output(outpoint))
            .unwrap();
        assert!(verified);
        assert_eq!(tx.compute_id(), tx.id);
    }

    #[test]
    fn test_exact_amount_has_no_change() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_chain, utxo_set) = funded(&[(&alice, 100)]);

        let tx = TransactionBuilder::new(&utxo_set)
            .build(&alice, &bob.address(), 100)
            .unwrap();
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn test_uses_several_outputs() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_chain, utxo_set) = funded(&[(&alice, 40), (&alice, 40), (&bob, 500)]);

        let tx = TransactionBuilder::new(&utxo_set)
            .build(&alice, &bob.address(), 60)
            .unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs[1].value, 20);
    }

    #[test]
    fn test_insufficient_funds() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let (_chain, utxo_set) = funded(&[(&alice, 100)]);

        let result = TransactionBuilder::new(&utxo_set).build(&alice, &bob.address(), 101);
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds { available: 100, requested: 101 })
        ));
    }

    #[test]
    fn test_invalid_recipient() {
        let alice = KeyPair::generate();
        let (_chain, utxo_set) = funded(&[(&alice, 100)]);

        let result = TransactionBuilder::new(&utxo_set)
            .build(&alice, &Address("bogus".to_string()), 10);
        assert!(matches!(result, Err(LedgerError::InvalidAddress(_))));
    }
}
