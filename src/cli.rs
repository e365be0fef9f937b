// CLI commands

use crate::config::{CONFIG_FILE, Config};
use crate::consensus::Miner;
use crate::core::{Block, Transaction};
use crate::error::{LedgerError, Result};
use crate::network::{ChannelBroadcaster, LogBroadcaster, Node};
use crate::storage::Ledger;
use crate::wallet::{Address, Keystore};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "utxo-ledger")]
#[command(about = "Proof-of-work UTXO ledger node", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a blockchain whose genesis reward goes to ADDRESS
    #[command(name = "createblockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Get the balance of an address
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Print every block from tip to genesis
    #[command(name = "printchain")]
    PrintChain,

    /// Send coins from one of our addresses
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Mine the transaction immediately instead of queueing it for the node
        #[arg(long)]
        mine: bool,
    },

    /// Create a new key pair in the keystore
    #[command(name = "createwallet")]
    CreateWallet,

    /// List the addresses in the keystore
    #[command(name = "listaddresses")]
    ListAddresses,

    /// Rebuild the UTXO index from the chain
    #[command(name = "reindexutxo")]
    ReindexUtxo,

    /// Run the node until interrupted, mining to ADDRESS if given
    #[command(name = "startnode")]
    StartNode {
        #[arg(long)]
        miner: Option<String>,
    },
}

/// CLI handler
pub struct CliHandler {
    config: Config,
    ledger: Arc<Ledger>,
    keystore: Keystore,
}

impl CliHandler {
    /// Open the ledger and keystore selected by `config`
    pub fn new(config: Config) -> Result<Self> {
        let miner = Miner::new(config.difficulty);
        let ledger = Arc::new(Ledger::open(config.chain_dir(), miner)?);
        let keystore = Keystore::open(config.keystore_path())?;

        Ok(Self {
            config,
            ledger,
            keystore,
        })
    }

    fn save_keystore(&self) -> Result<()> {
        let path = self.config.keystore_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.keystore.save(path)
    }

    /// Handle CLI command
    pub fn handle(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::CreateBlockchain { address } => self.create_blockchain(&address),
            Commands::GetBalance { address } => self.get_balance(&address),
            Commands::PrintChain => self.print_chain(),
            Commands::Send { from, to, amount, mine } => self.send(&from, &to, amount, mine),
            Commands::CreateWallet => {
                let address = self.keystore.new_address();
                self.save_keystore()?;
                println!("New address: {}", address);
                Ok(())
            }
            Commands::ListAddresses => {
                for address in self.keystore.list_addresses() {
                    println!("{}", address);
                }
                Ok(())
            }
            Commands::ReindexUtxo => {
                self.ledger.head()?;
                let count = self.ledger.reindex()?;
                println!("Done! There are {} transactions in the UTXO set.", count);
                Ok(())
            }
            Commands::StartNode { miner } => self.start_node(miner),
        }
    }

    fn create_blockchain(&self, address: &str) -> Result<()> {
        let recipient = Address(address.to_string()).to_pubkey_hash()?;
        let coinbase = Transaction::coinbase(recipient, vec![], self.config.mining_reward);

        let genesis = self.ledger.initialize(coinbase)?;
        println!("Blockchain created");
        println!("  Genesis: {}", genesis.hash);
        Ok(())
    }

    fn get_balance(&self, address: &str) -> Result<()> {
        let pubkey_hash = Address(address.to_string()).to_pubkey_hash()?;
        self.ledger.head()?;

        let balance = self.ledger.balance(&pubkey_hash)?;
        println!("Balance of {}: {}", address, balance);
        Ok(())
    }

    fn print_chain(&self) -> Result<()> {
        let storage = self.ledger.read();
        for block in storage.blockchain.iter()? {
            let block = block?;
            self.print_block(&block);
        }
        Ok(())
    }

    fn print_block(&self, block: &Block) {
        println!("Hash: {}", block.hash);
        println!("Prev hash: {}", block.prev_hash);
        println!("Height: {}", block.height);
        println!("Nonce: {}", block.nonce);
        println!("PoW: {}", self.ledger.miner().verify(block));
        for tx in &block.transactions {
            println!("{}", tx);
        }
        println!();
    }

    fn send(&self, from: &str, to: &str, amount: u64, mine: bool) -> Result<()> {
        let from = Address(from.to_string());
        from.to_pubkey_hash()?;
        let to = Address(to.to_string());
        to.to_pubkey_hash()?;

        let keypair = self
            .keystore
            .get_keypair(&from)
            .ok_or_else(|| LedgerError::Wallet(format!("no key for {} in keystore", from)))?;

        self.ledger.head()?;
        let node = Node::new(
            Arc::clone(&self.ledger),
            self.config.mining_reward,
            Box::new(LogBroadcaster),
        );
        // Keep transactions queued by earlier commands in the persisted pool
        node.restore_pending()?;
        let tx = node.send(keypair, &to, amount, mine)?;

        if mine {
            println!("Transaction {} mined", tx.id);
        } else {
            println!(
                "Transaction {} queued, {} pending until a node mines them",
                tx.id,
                node.pending_count()
            );
        }
        println!("Success!");
        Ok(())
    }

    fn start_node(&self, miner: Option<String>) -> Result<()> {
        self.ledger.head()?;
        let reward_pkh = match &miner {
            Some(address) => Some(Address(address.clone()).to_pubkey_hash()?),
            None => None,
        };

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            let (broadcaster, mut relay) = ChannelBroadcaster::channel();
            let node = Arc::new(Node::new(
                Arc::clone(&self.ledger),
                self.config.mining_reward,
                Box::new(broadcaster),
            ));
            let restored = node.restore_pending()?;
            if restored > 0 {
                println!("{} pending transactions restored", restored);
            }

            tokio::spawn(async move {
                while let Some(tx) = relay.recv().await {
                    log::info!("Relaying transaction {}", tx.id);
                }
            });

            let handle = match reward_pkh {
                Some(pkh) => {
                    log::info!("Mining is on, rewards go to {}", miner.as_deref().unwrap_or_default());
                    Some(node.spawn_miner(
                        pkh,
                        self.config.poll_interval(),
                        self.config.miner.min_pending_transactions,
                    )?)
                }
                None => None,
            };

            println!("Node running on {}, press Ctrl-C to stop", self.config.chain_dir().display());
            tokio::signal::ctrl_c().await?;

            if let Some(handle) = handle {
                tokio::task::spawn_blocking(move || handle.stop())
                    .await
                    .map_err(|e| LedgerError::Io(std::io::Error::other(e)))?;
            }
            Ok::<(), LedgerError>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(dir: &std::path::Path) -> CliHandler {
        let config = Config {
            data_dir: dir.to_string_lossy().into_owned(),
            difficulty: 4,
            ..Config::default()
        };
        CliHandler::new(config).unwrap()
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "utxo-ledger", "send", "--from", "a", "--to", "b", "--amount", "5", "--mine",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Commands::Send { amount: 5, mine: true, .. }
        ));
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
    }

    #[test]
    fn test_wallet_chain_and_send() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());

        handler.handle(Commands::CreateWallet).unwrap();
        handler.handle(Commands::CreateWallet).unwrap();
        let addresses = handler.keystore.list_addresses();
        let (alice, bob) = (addresses[0].to_string(), addresses[1].to_string());

        handler
            .handle(Commands::CreateBlockchain { address: alice.clone() })
            .unwrap();
        handler
            .handle(Commands::Send { from: alice.clone(), to: bob.clone(), amount: 25, mine: true })
            .unwrap();

        let bob_hash = Address(bob).to_pubkey_hash().unwrap();
        let alice_hash = Address(alice).to_pubkey_hash().unwrap();
        assert_eq!(handler.ledger.balance(&bob_hash).unwrap(), 25);
        assert_eq!(handler.ledger.balance(&alice_hash).unwrap(), 175);

        handler.handle(Commands::ReindexUtxo).unwrap();
        handler.handle(Commands::PrintChain).unwrap();
        assert!(handler.ledger.verify_index().unwrap());
    }

    #[test]
    fn test_send_without_mine_waits_for_the_node() {
        let dir = tempfile::tempdir().unwrap();
        let (alice, bob) = {
            let mut handler = handler(dir.path());
            handler.handle(Commands::CreateWallet).unwrap();
            handler.handle(Commands::CreateWallet).unwrap();
            let addresses = handler.keystore.list_addresses();
            let (alice, bob) = (addresses[0].to_string(), addresses[1].to_string());

            handler
                .handle(Commands::CreateBlockchain { address: alice.clone() })
                .unwrap();
            handler
                .handle(Commands::Send { from: alice.clone(), to: bob.clone(), amount: 25, mine: false })
                .unwrap();
            (Address(alice).to_pubkey_hash().unwrap(), Address(bob).to_pubkey_hash().unwrap())
        };

        // A later process opening the same data directory picks the transaction up
        let handler = handler(dir.path());
        assert_eq!(handler.ledger.balance(&bob).unwrap(), 0);
        assert_eq!(handler.ledger.read().pending.len(), 1);

        let node = Node::new(
            Arc::clone(&handler.ledger),
            handler.config.mining_reward,
            Box::new(LogBroadcaster),
        );
        assert_eq!(node.restore_pending().unwrap(), 1);
        node.mine_pending(&alice).unwrap().unwrap();

        assert_eq!(handler.ledger.balance(&bob).unwrap(), 25);
        assert_eq!(handler.ledger.balance(&alice).unwrap(), 175);
        assert!(handler.ledger.read().pending.is_empty());
    }

    #[test]
    fn test_commands_need_a_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());
        handler.handle(Commands::CreateWallet).unwrap();
        let address = handler.keystore.list_addresses()[0].to_string();

        let result = handler.handle(Commands::GetBalance { address });
        assert!(matches!(result, Err(LedgerError::NotInitialized)));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = handler(dir.path());

        let result = handler.handle(Commands::CreateBlockchain { address: "nope".to_string() });
        assert!(matches!(result, Err(LedgerError::InvalidAddress(_))));
    }
}
