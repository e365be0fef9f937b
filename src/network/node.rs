// Ledger node - mempool, block admission and the mining worker

use crate::consensus::{BlockValidator, TransactionValidator};
use crate::core::{Block, Signer, Transaction, Verifier, pubkey_hash};
use crate::error::{LedgerError, Result};
use crate::network::Broadcaster;
use crate::storage::{Ledger, Storage};
use crate::wallet::{Address, Secp256k1Verifier, TransactionBuilder};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Ledger node
pub struct Node {
    ledger: Arc<Ledger>,
    validator: BlockValidator,
    verifier: Box<dyn Verifier + Send + Sync>,
    broadcaster: Box<dyn Broadcaster>,
    /// Pending transactions, oldest first
    mempool: Mutex<VecDeque<Transaction>>,
    /// Cancellation tokens of in-flight nonce searches
    searches: Mutex<Vec<Arc<AtomicBool>>>,
    reward: u64,
}

impl Node {
    /// Create a node over `ledger` that mints `reward` per block
    pub fn new(ledger: Arc<Ledger>, reward: u64, broadcaster: Box<dyn Broadcaster>) -> Self {
        let validator = BlockValidator::new(*ledger.miner(), reward);
        Self {
            ledger,
            validator,
            verifier: Box::new(Secp256k1Verifier::new()),
            broadcaster,
            mempool: Mutex::new(VecDeque::new()),
            searches: Mutex::new(Vec::new()),
            reward,
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn Verifier + Send + Sync>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.lock().len()
    }

    /// Pending transactions in arrival order
    pub fn pending(&self) -> Vec<Transaction> {
        self.mempool.lock().iter().cloned().collect()
    }

    /// Admit a transaction to the mempool after checking it against the
    /// index and against outputs already claimed by pending transactions
    pub fn accept_transaction(&self, tx: Transaction) -> Result<()> {
        let storage = self.ledger.read();
        let mut mempool = self.mempool.lock();

        if mempool.iter().any(|pending| pending.id == tx.id) {
            return Err(LedgerError::DuplicateTransaction(tx.id));
        }

        let claimed: HashSet<_> = mempool
            .iter()
            .flat_map(|pending| pending.inputs.iter().map(|input| input.outpoint()))
            .collect();
        if let Some(input) = tx.inputs.iter().find(|input| claimed.contains(&input.outpoint())) {
            return Err(crate::consensus::ValidationError::DoubleSpend(input.outpoint()).into());
        }

        TransactionValidator::validate(&tx, self.verifier.as_ref(), |outpoint| {
            storage.utxo_set.find_output(outpoint)
        })?;

        let id = tx.id;
        mempool.push_back(tx);
        if let Err(e) = storage.pending.save(mempool.iter()) {
            mempool.pop_back();
            return Err(e);
        }

        log::info!("Accepted transaction {} into mempool", id);
        Ok(())
    }

    /// Re-admit the transactions persisted by an earlier run. Entries that
    /// no longer validate are dropped from the store. Returns how many were kept.
    pub fn restore_pending(&self) -> Result<usize> {
        let stored = self.ledger.read().pending.load()?;
        let mut restored = 0;
        for tx in stored {
            let id = tx.id;
            match self.accept_transaction(tx) {
                Ok(()) => restored += 1,
                Err(e) => log::warn!("Dropping stored transaction {}: {}", id, e),
            }
        }

        let storage = self.ledger.read();
        let mempool = self.mempool.lock();
        storage.pending.save(mempool.iter())?;
        log::info!("Restored {} pending transactions", restored);
        Ok(restored)
    }

    /// Admit a block mined elsewhere. Once it is appended any local search
    /// is abandoned.
    pub fn accept_block(&self, block: Block) -> Result<()> {
        let known = self.ledger.read().blockchain.has_block(&block.hash)?;
        if known {
            log::debug!("Block {} already in chain", block.hash);
            return Ok(());
        }

        self.validator.validate_block(&block)?;
        self.append_checked(&block)?;
        self.cancel_mining();

        log::info!("Accepted block {} at height {}", block.hash, block.height);
        self.prune_mempool()
    }

    /// Pay `amount` from the signer's outputs to `to`. With `mine_now` the
    /// transaction is mined straight away with the reward going to the
    /// sender; otherwise it joins the mempool and is broadcast. A failed
    /// broadcast is only logged, the transaction stays queued.
    pub fn send(
        &self,
        signer: &dyn Signer,
        to: &Address,
        amount: u64,
        mine_now: bool,
    ) -> Result<Transaction> {
        let tx = {
            let storage = self.ledger.read();
            TransactionBuilder::new(&storage.utxo_set).build(signer, to, amount)?
        };

        if mine_now {
            let reward_pkh = pubkey_hash(&signer.public_key());
            self.mine_candidate(vec![tx.clone()], &reward_pkh, &AtomicBool::new(false))?;
            self.prune_mempool()?;
        } else {
            self.accept_transaction(tx.clone())?;
            if let Err(e) = self.broadcaster.broadcast(&tx) {
                log::warn!("Transaction {} queued but not relayed: {}", tx.id, e);
            }
        }

        Ok(tx)
    }

    /// Mine one block of all pending transactions with a coinbase to
    /// `reward_pkh`. `Ok(None)` when the search was cancelled or another
    /// block took the tip first; the transactions stay pending.
    pub fn mine_pending(&self, reward_pkh: &[u8]) -> Result<Option<Block>> {
        self.mine_pending_until(reward_pkh, &AtomicBool::new(false))
    }

    fn mine_pending_until(&self, reward_pkh: &[u8], shutdown: &AtomicBool) -> Result<Option<Block>> {
        self.prune_mempool()?;
        let pending = self.pending();

        match self.mine_candidate(pending, reward_pkh, shutdown) {
            Ok(block) => {
                self.prune_mempool()?;
                Ok(Some(block))
            }
            Err(LedgerError::MiningCancelled) => Ok(None),
            Err(LedgerError::ChainLinkage { block, .. }) => {
                log::info!("Candidate {} went stale, tip moved", block);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Seal coinbase + `transactions` on the current tip and append it.
    /// The ledger lock is not held during the search.
    fn mine_candidate(
        &self,
        transactions: Vec<Transaction>,
        reward_pkh: &[u8],
        shutdown: &AtomicBool,
    ) -> Result<Block> {
        let head = self.ledger.head()?;
        let mut txs = Vec::with_capacity(transactions.len() + 1);
        txs.push(Transaction::coinbase(reward_pkh.to_vec(), vec![], self.reward));
        txs.extend(transactions);
        let candidate = Block::new(head.hash, txs, head.height + 1);

        let token = self.begin_search(shutdown);
        let sealed = self.ledger.miner().seal(candidate, &token);
        self.end_search(&token);
        let block = sealed?;

        self.append_checked(&block)?;
        Ok(block)
    }

    /// Validate against the state the block lands on, then append, in one critical section
    fn append_checked(&self, block: &Block) -> Result<()> {
        self.ledger.append_with(block, |storage: &Storage| {
            let tip = storage.blockchain.tip_hash()?.ok_or(LedgerError::NotInitialized)?;
            if block.prev_hash != tip {
                return Err(LedgerError::ChainLinkage {
                    block: block.hash,
                    expected: tip,
                    found: block.prev_hash,
                    height: block.height,
                });
            }
            self.validator.validate_block(block)?;
            self.validator
                .validate_transactions(block, self.verifier.as_ref(), &storage.utxo_set)
        })
    }

    /// Drop pending transactions that were mined or no longer validate
    fn prune_mempool(&self) -> Result<()> {
        let storage = self.ledger.read();
        let mut mempool = self.mempool.lock();
        let mut claimed = HashSet::new();
        let mut kept = VecDeque::with_capacity(mempool.len());

        for tx in mempool.drain(..) {
            if tx.inputs.iter().any(|input| claimed.contains(&input.outpoint())) {
                log::debug!("Dropping conflicting transaction {}", tx.id);
                continue;
            }
            let valid = TransactionValidator::validate(&tx, self.verifier.as_ref(), |outpoint| {
                storage.utxo_set.find_output(outpoint)
            });
            match valid {
                Ok(()) => {
                    claimed.extend(tx.inputs.iter().map(|input| input.outpoint()));
                    kept.push_back(tx);
                }
                Err(e) => log::debug!("Dropping transaction {} from mempool: {}", tx.id, e),
            }
        }

        *mempool = kept;
        storage.pending.save(mempool.iter())
    }

    /// Register a search token; it starts cancelled if `shutdown` is already set
    fn begin_search(&self, shutdown: &AtomicBool) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.searches.lock().push(Arc::clone(&token));
        if shutdown.load(Ordering::SeqCst) {
            token.store(true, Ordering::SeqCst);
        }
        token
    }

    fn end_search(&self, token: &Arc<AtomicBool>) {
        self.searches.lock().retain(|t| !Arc::ptr_eq(t, token));
    }

    /// Cancel every in-flight nonce search
    pub fn cancel_mining(&self) {
        for token in self.searches.lock().drain(..) {
            token.store(true, Ordering::SeqCst);
        }
    }

    /// Start a background miner that seals pending transactions whenever
    /// at least `min_pending` are queued
    pub fn spawn_miner(
        self: &Arc<Self>,
        reward_pkh: Vec<u8>,
        poll_interval: Duration,
        min_pending: usize,
    ) -> Result<MinerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let node = Arc::clone(self);
        let flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || {
                log::info!("Miner started");
                while !flag.load(Ordering::SeqCst) {
                    if node.pending_count() < min_pending {
                        thread::sleep(poll_interval);
                        continue;
                    }
                    match node.mine_pending_until(&reward_pkh, &flag) {
                        Ok(Some(block)) => log::info!(
                            "Miner appended block {} with {} transactions",
                            block.hash,
                            block.transactions.len()
                        ),
                        Ok(None) => {}
                        Err(e) if e.is_fatal() => {
                            log::error!("Miner stopping: {}", e);
                            break;
                        }
                        Err(e) => {
                            log::warn!("Mining failed: {}", e);
                            thread::sleep(poll_interval);
                        }
                    }
                }
                log::info!("Miner stopped");
            })?;

        Ok(MinerHandle {
            node: Arc::clone(self),
            shutdown,
            thread: Some(thread),
        })
    }
}

/// Handle to the background miner
pub struct MinerHandle {
    node: Arc<Node>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MinerHandle {
    /// Cancel the current search and wait for the worker to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.node.cancel_mining();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Miner thread panicked");
            }
        }
    }
}

impl Drop for MinerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
