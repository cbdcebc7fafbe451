//! Node configuration, read from TOML

use crate::constants::*;
use crate::network::PoolSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub utxo: UtxoConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host name or address of the bootstrap peer
    pub seed: String,
    pub port: u16,
    pub max_peers: usize,
    pub address_book_target: usize,
    pub download_fanout: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            seed: "73.142.142.138".to_string(),
            port: DEFAULT_PORT,
            max_peers: MAX_ACTIVE_PEERS,
            address_book_target: ADDRESS_BOOK_TARGET,
            download_fanout: DOWNLOAD_FANOUT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: PathBuf::from("./lightnode-data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UtxoConfig {
    /// Build the UTXO set once the header chain is synced
    pub enabled: bool,
    /// Extra heights fetched per download batch
    pub step: u64,
    pub checkpoint_interval: u64,
}

impl Default for UtxoConfig {
    fn default() -> Self {
        UtxoConfig {
            enabled: true,
            step: DEFAULT_UTXO_STEP,
            checkpoint_interval: UTXO_CHECKPOINT_INTERVAL,
        }
    }
}

impl NodeConfig {
    /// Read the TOML file at `path`. Missing sections and keys take defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("couldn't read config file {}", path.as_ref().display()))?;
        toml::from_str(&text)
            .with_context(|| format!("invalid TOML in config file {}", path.as_ref().display()))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            magic: MAINNET_MAGIC,
            max_active: self.network.max_peers.max(1),
            address_book_target: self.network.address_book_target,
            download_fanout: self.network.download_fanout.max(1),
        }
    }
}
