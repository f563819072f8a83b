use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Amount};

/// Default number of blocks between parent-chain relay checkpoints.
pub const DEFAULT_RELAY_INTERVAL: u64 = 6;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub rpc_listen: SocketAddr,
    pub block_time_ms: u64,
    pub mempool_limit: usize,
    #[serde(default = "default_relay_interval")]
    pub relay_interval: u64,
    pub genesis: GenesisConfig,
}

fn default_relay_interval() -> u64 {
    DEFAULT_RELAY_INTERVAL
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            rpc_listen: "127.0.0.1:7070".parse().expect("valid socket addr"),
            block_time_ms: 5_000,
            mempool_limit: 8_192,
            relay_interval: DEFAULT_RELAY_INTERVAL,
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    pub accounts: Vec<GenesisAccount>,
    pub root_accounts: RootAccounts,
    pub verifiers: Vec<Address>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "stem-local".to_string(),
            accounts: Vec::new(),
            root_accounts: RootAccounts::default(),
            verifiers: Vec::new(),
        }
    }
}

/// Well-known accounts the subchain treats specially: transactions addressed
/// to them admit or release verifiers, raise challenges, or collect fees.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootAccounts {
    pub challenge_account: Address,
    pub deposit_account: Address,
    pub exit_account: Address,
    pub fee_account: Address,
}

impl Default for RootAccounts {
    fn default() -> Self {
        Self {
            challenge_account: "10".repeat(20),
            deposit_account: "20".repeat(20),
            exit_account: "30".repeat(20),
            fee_account: "40".repeat(20),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: String,
    pub balance: String,
}

impl GenesisAccount {
    pub fn balance_value(&self) -> ChainResult<Amount> {
        self.balance
            .parse()
            .map_err(|_| ChainError::Config("invalid genesis balance".to_string()))
    }
}
