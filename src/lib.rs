//! # lightnode
//!
//! A minimal peer node for the Bitcoin network: it discovers peers, speaks the
//! binary P2P protocol, follows the header chain and derives the UTXO set by
//! replaying full blocks in height order.
//!
//! ## Architecture
//!
//! - `codec` / `message`: framing, checksums, varints, per-command payloads
//! - `peer`: one connection, its socket tasks and handshake state
//! - `network`: the peer pool, subscriber dispatch and block downloads
//! - `chain`: header-chain sync state machine
//! - `utxo`: UTXO set replay and checkpoints
//! - `store` / `decoder`: persistence and full-block parsing collaborators
//!
//! Headers and blocks are trusted beyond linkage and structure: there is no
//! proof-of-work validation and no script execution.
//!
//! ## Usage
//!
//! ```no_run
//! use lightnode::{LightNode, NodeConfig, MemoryStore, WireBlockDecoder, PeerAddress};
//! use std::sync::Arc;
//!
//! # async fn example() -> lightnode::Result<()> {
//! let node = LightNode::new(
//!     NodeConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(WireBlockDecoder),
//! );
//! let seed = PeerAddress::new("73.142.142.138".parse().unwrap(), 8333);
//! node.run(seed).await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod codec;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod download;
pub mod error;
pub mod message;
pub mod network;
pub mod peer;
pub mod store;
pub mod types;
pub mod utxo;

// Re-export commonly used types
pub use chain::{ChainStatus, ChainSync, SyncState};
pub use config::NodeConfig;
pub use decoder::{BlockDecoder, WireBlockDecoder};
pub use error::{NodeError, Result};
pub use message::{Command, NetworkMessage};
pub use network::{InboundMessage, NetworkManager, PeerNetwork};
pub use store::{FileStore, MemoryStore, Store};
pub use types::*;
pub use utxo::{UtxoBuilder, UtxoSet};

use std::sync::Arc;
use tracing::{error, info};

/// Wires the peer pool, chain sync and the UTXO builder together
pub struct LightNode {
    config: NodeConfig,
    store: Arc<dyn Store>,
    decoder: Arc<dyn BlockDecoder>,
    network: NetworkManager,
}

impl LightNode {
    pub fn new(config: NodeConfig, store: Arc<dyn Store>, decoder: Arc<dyn BlockDecoder>) -> Self {
        let network = NetworkManager::new(config.pool_settings());
        LightNode {
            config,
            store,
            decoder,
            network,
        }
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    /// Connect to `seed` and run until the network or chain sync stops. An
    /// unreachable seed is not fatal; the pool keeps redialing it.
    ///
    /// The UTXO build starts in the background the first time the chain
    /// reports `Synced`.
    pub async fn run(&self, seed: PeerAddress) -> Result<()> {
        let headers = self.network.subscribe(Command::Headers).await;
        let invs = self.network.subscribe(Command::Inv).await;

        let peers: Arc<dyn PeerNetwork> = Arc::new(self.network.clone());
        let mut chain = ChainSync::open(self.store.clone(), peers.clone())?;
        let synced = chain.on_synced();

        let utxo = if self.config.utxo.enabled {
            let builder = UtxoBuilder::new(
                self.store.clone(),
                peers,
                self.decoder.clone(),
                self.config.utxo.step,
                self.config.utxo.checkpoint_interval,
            );
            Some(tokio::spawn(async move {
                if synced.await.is_err() {
                    return;
                }
                match builder.start(SyncState::Synced).await {
                    Ok(Some(set)) => info!(entries = set.len(), "utxo set ready"),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "utxo build failed"),
                }
            }))
        } else {
            None
        };

        info!(%seed, "connecting to seed");
        self.network.add_seed(seed).await;

        let result = tokio::select! {
            r = self.network.run() => r,
            r = chain.run(headers, invs) => r,
        };
        if let Some(task) = utxo {
            task.abort();
        }
        result
    }
}
