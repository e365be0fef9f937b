// Node configuration (TOML file + NODE_ID environment variable)

use crate::consensus::{DEFAULT_DIFFICULTY, MAX_DIFFICULTY};
use crate::error::{LedgerError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable selecting the node's data directory and keystore
pub const NODE_ID_ENV: &str = "NODE_ID";

/// Default configuration file name
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    pub node_id: Option<String>,
    pub difficulty: u32,
    pub mining_reward: u64,
    pub miner: MinerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MinerConfig {
    pub poll_interval_ms: u64,
    /// Pending transactions needed before the background miner starts a block
    pub min_pending_transactions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            node_id: None,
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: default_mining_reward(),
            miner: MinerConfig::default(),
        }
    }
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            min_pending_transactions: 1,
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_mining_reward() -> u64 {
    100
}

impl Config {
    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists (defaults otherwise), then apply `NODE_ID`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            log::debug!("Loading configuration from {}", path.display());
            Self::from_toml(&fs::read_to_string(path)?)?
        } else {
            Self::default()
        };

        let config = config.with_node_id(std::env::var(NODE_ID_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override the node id; `None` or an empty value keeps the current one
    pub fn with_node_id(mut self, node_id: Option<String>) -> Self {
        if let Some(id) = node_id.filter(|id| !id.trim().is_empty()) {
            self.node_id = Some(id.trim().to_string());
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.is_empty() {
            return Err(LedgerError::Config("data_dir must be set".to_string()));
        }
        if self.difficulty > MAX_DIFFICULTY {
            return Err(LedgerError::Config(format!(
                "difficulty {} exceeds maximum {}",
                self.difficulty, MAX_DIFFICULTY
            )));
        }
        if self.mining_reward == 0 {
            return Err(LedgerError::Config("mining_reward must be positive".to_string()));
        }
        if self.miner.poll_interval_ms == 0 {
            return Err(LedgerError::Config("miner.poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Directory holding this node's block store and UTXO index
    pub fn chain_dir(&self) -> PathBuf {
        match &self.node_id {
            Some(id) => Path::new(&self.data_dir).join(format!("node_{}", id)),
            None => PathBuf::from(&self.data_dir),
        }
    }

    /// This node's keystore file
    pub fn keystore_path(&self) -> PathBuf {
        let file = match &self.node_id {
            Some(id) => format!("wallet_{}.json", id),
            None => "wallet.json".to_string(),
        };
        Path::new(&self.data_dir).join(file)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.miner.poll_interval_ms)
    }
}
