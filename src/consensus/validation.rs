// Transaction and block validation

use crate::core::{Block, OutPoint, Transaction, TxOutput, Verifier};
use crate::consensus::pow::Miner;
use crate::error::{LedgerError, Result};
use crate::storage::UtxoSet;
use std::collections::{HashMap, HashSet};

/// Reasons a block or transaction is rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Block hash doesn't meet PoW target or doesn't match its contents
    InvalidProofOfWork,
    /// Block has no transactions
    NoTransactions,
    /// First transaction is not coinbase
    MissingCoinbase,
    /// Coinbase transaction in non-first position
    CoinbaseNotFirst,
    /// Coinbase mints more than the block reward
    CoinbaseValueTooHigh { value: u64, reward: u64 },
    /// Coinbase submitted as a standalone transaction
    UnexpectedCoinbase,
    /// Transaction has no inputs or outputs
    EmptyTransaction,
    /// Stored id differs from the recomputed one
    IdMismatch,
    /// An input signature or key does not match the spent output
    InvalidSignature,
    /// Inputs and outputs carry different totals
    ValueMismatch { inputs: u64, outputs: u64 },
    /// Summed values overflow
    ValueOverflow,
    /// The same output is spent twice
    DoubleSpend(OutPoint),
    /// A transaction with this id still has unspent outputs
    DuplicateTransaction,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ValidationError::InvalidProofOfWork => write!(f, "Invalid proof of work"),
            ValidationError::NoTransactions => write!(f, "Block has no transactions"),
            ValidationError::MissingCoinbase => write!(f, "Missing coinbase transaction"),
            ValidationError::CoinbaseNotFirst => write!(f, "Coinbase not in first position"),
            ValidationError::CoinbaseValueTooHigh { value, reward } => {
                write!(f, "Coinbase mints {} but the reward is {}", value, reward)
            }
            ValidationError::UnexpectedCoinbase => write!(f, "Coinbase outside a block"),
            ValidationError::EmptyTransaction => write!(f, "Empty transaction"),
            ValidationError::IdMismatch => write!(f, "Transaction id does not match contents"),
            ValidationError::InvalidSignature => write!(f, "Invalid signature"),
            ValidationError::ValueMismatch { inputs, outputs } => {
                write!(f, "Inputs total {} but outputs total {}", inputs, outputs)
            }
            ValidationError::ValueOverflow => write!(f, "Value overflow"),
            ValidationError::DoubleSpend(outpoint) => write!(f, "Output {} spent twice", outpoint),
            ValidationError::DuplicateTransaction => write!(f, "Duplicate transaction id"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Block validator
pub struct BlockValidator {
    /// PoW miner for verification
    miner: Miner,
    /// Maximum value a coinbase may mint
    reward: u64,
}

impl BlockValidator {
    pub fn new(miner: Miner, reward: u64) -> Self {
        Self { miner, reward }
    }

    /// Structural and proof-of-work checks that need no chain state
    pub fn validate_block(&self, block: &Block) -> std::result::Result<(), ValidationError> {
        if !self.miner.verify(block) {
            return Err(ValidationError::InvalidProofOfWork);
        }

        // Must have at least one transaction
        if block.transactions.is_empty() {
            return Err(ValidationError::NoTransactions);
        }

        let coinbase = block.coinbase().ok_or(ValidationError::MissingCoinbase)?;

        // Only first transaction can be coinbase
        if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
            return Err(ValidationError::CoinbaseNotFirst);
        }

        if coinbase.compute_id() != coinbase.id {
            return Err(ValidationError::IdMismatch);
        }

        let value = coinbase
            .total_output_value()
            .ok_or(ValidationError::ValueOverflow)?;
        if value > self.reward {
            return Err(ValidationError::CoinbaseValueTooHigh { value, reward: self.reward });
        }

        Ok(())
    }

    /// Check every transaction against the index plus outputs created
    /// earlier in the same block. Spends are checked before outputs are
    /// added, transaction by transaction in block order.
    pub fn validate_transactions(
        &self,
        block: &Block,
        verifier: &dyn Verifier,
        utxo_set: &UtxoSet,
    ) -> Result<()> {
        let mut created: HashMap<OutPoint, TxOutput> = HashMap::new();
        let mut spent: HashSet<OutPoint> = HashSet::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let outpoint = input.outpoint();
                    if !spent.insert(outpoint) {
                        return Err(ValidationError::DoubleSpend(outpoint).into());
                    }
                }

                TransactionValidator::validate(tx, verifier, |outpoint| match created.get(outpoint) {
                    Some(output) => Ok(Some(output.clone())),
                    None => utxo_set.find_output(outpoint),
                })?;
            }

            let already_known = (0..tx.outputs.len() as u32)
                .any(|index| created.contains_key(&OutPoint::new(tx.id, index)));
            if already_known || utxo_set.contains_transaction(&tx.id)? {
                return Err(ValidationError::DuplicateTransaction.into());
            }

            for (index, output) in tx.outputs.iter().enumerate() {
                created.insert(OutPoint::new(tx.id, index as u32), output.clone());
            }
        }

        Ok(())
    }
}

/// Transaction validator (for mempool and block admission)
pub struct TransactionValidator;

impl TransactionValidator {
    /// Validate a non-coinbase transaction. `lookup` resolves spendable outputs.
    pub fn validate<F>(tx: &Transaction, verifier: &dyn Verifier, mut lookup: F) -> Result<()>
    where
        F: FnMut(&OutPoint) -> Result<Option<TxOutput>>,
    {
        if tx.is_coinbase() {
            return Err(ValidationError::UnexpectedCoinbase.into());
        }

        // Must have inputs and outputs
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(ValidationError::EmptyTransaction.into());
        }

        if tx.compute_id() != tx.id {
            return Err(ValidationError::IdMismatch.into());
        }

        let mut prev_outputs: HashMap<OutPoint, TxOutput> = HashMap::new();
        let mut input_total = 0u64;
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            if prev_outputs.contains_key(&outpoint) {
                return Err(ValidationError::DoubleSpend(outpoint).into());
            }
            let prev = lookup(&outpoint)?.ok_or(LedgerError::DanglingInput {
                txid: outpoint.txid,
                index: outpoint.index,
            })?;
            input_total = input_total
                .checked_add(prev.value)
                .ok_or(ValidationError::ValueOverflow)?;
            prev_outputs.insert(outpoint, prev);
        }

        if !tx.verify(verifier, |outpoint| Ok(prev_outputs.get(outpoint).cloned()))? {
            return Err(ValidationError::InvalidSignature.into());
        }

        let output_total = tx.total_output_value().ok_or(ValidationError::ValueOverflow)?;

        // No fees: every unit spent must be paid out again
        if input_total != output_total {
            return Err(ValidationError::ValueMismatch {
                inputs: input_total,
                outputs: output_total,
            }
            .into());
        }

        Ok(())
    }
}
