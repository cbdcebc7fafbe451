//! UTXO set construction by replaying downloaded blocks in height order

use crate::chain::SyncState;
use crate::constants::{UTXO_RETRY_BACKOFF, UTXO_SNAPSHOT_ID};
use crate::decoder::BlockDecoder;
use crate::error::Result;
use crate::network::PeerNetwork;
use crate::store::Store;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One output position of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSlot {
    Available(TxOutput),
    Spent,
}

/// Outputs of one transaction, positionally indexed. Slots only ever go
/// from available to spent; the entry is dropped once nothing is left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub slots: Vec<OutputSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timelock: Option<u32>,
}

impl UtxoEntry {
    fn from_outputs(outputs: &[TxOutput], timelock: Option<u32>) -> Self {
        UtxoEntry {
            slots: outputs.iter().cloned().map(OutputSlot::Available).collect(),
            timelock,
        }
    }

    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        match self.slots.get(index as usize) {
            Some(OutputSlot::Available(output)) => Some(output),
            _ => None,
        }
    }

    pub fn is_fully_spent(&self) -> bool {
        self.slots.iter().all(|slot| *slot == OutputSlot::Spent)
    }

    /// Tombstone `index`; false if it was absent or already spent
    fn spend(&mut self, index: u32) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot @ OutputSlot::Available(_)) => {
                *slot = OutputSlot::Spent;
                true
            }
            _ => false,
        }
    }
}

/// Counters from applying one block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub created: usize,
    pub spent: usize,
    pub missing: usize,
}

/// Unspent outputs keyed by txid in display hex
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtxoSet {
    entries: BTreeMap<String, UtxoEntry>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, txid: &Hash) -> Option<&UtxoEntry> {
        self.entries.get(&to_display_hex(txid))
    }

    pub fn output(&self, txid: &Hash, index: u32) -> Option<&TxOutput> {
        self.get(txid).and_then(|entry| entry.output(index))
    }

    /// Apply a block: the first transaction is the coinbase and only creates
    /// outputs; every other transaction spends its inputs and then creates.
    pub fn apply_block(&mut self, block: &Block) -> ApplyStats {
        let mut stats = ApplyStats::default();
        for (position, tx) in block.transactions.iter().enumerate() {
            if position > 0 {
                self.spend_inputs(tx, &mut stats);
            }
            let timelock = if position == 0 { None } else { tx.timelock };
            self.insert_outputs(tx, timelock, &mut stats);
        }
        stats
    }

    fn spend_inputs(&mut self, tx: &Transaction, stats: &mut ApplyStats) {
        for input in &tx.inputs {
            let key = to_display_hex(&input.prev_txid);
            let Some(entry) = self.entries.get_mut(&key) else {
                debug!(txid = %key, index = input.prev_index, "spent output not in set");
                stats.missing += 1;
                continue;
            };
            if entry.spend(input.prev_index) {
                stats.spent += 1;
            } else {
                debug!(txid = %key, index = input.prev_index, "output already spent or absent");
                stats.missing += 1;
            }
            if entry.is_fully_spent() {
                self.entries.remove(&key);
            }
        }
    }

    fn insert_outputs(&mut self, tx: &Transaction, timelock: Option<u32>, stats: &mut ApplyStats) {
        if tx.outputs.is_empty() {
            return;
        }
        stats.created += tx.outputs.len();
        self.entries.insert(
            to_display_hex(&tx.txid),
            UtxoEntry::from_outputs(&tx.outputs, timelock),
        );
    }
}

/// Persisted builder progress: next height to apply, batch size, the set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSnapshot {
    pub height: u64,
    pub step: u64,
    pub utxo: UtxoSet,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Replays blocks from the persisted chain into a [`UtxoSet`].
///
/// Runs at most once per process and only when the chain is synced.
pub struct UtxoBuilder {
    store: Arc<dyn Store>,
    network: Arc<dyn PeerNetwork>,
    decoder: Arc<dyn BlockDecoder>,
    default_step: u64,
    checkpoint_interval: u64,
    retry_backoff: Duration,
    started: AtomicBool,
}

impl UtxoBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<dyn PeerNetwork>,
        decoder: Arc<dyn BlockDecoder>,
        default_step: u64,
        checkpoint_interval: u64,
    ) -> Self {
        UtxoBuilder {
            store,
            network,
            decoder,
            default_step,
            checkpoint_interval: checkpoint_interval.max(1),
            retry_backoff: UTXO_RETRY_BACKOFF,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Build the set up to the current tip.
    ///
    /// Returns `None` without doing anything when the chain is not synced or
    /// a build already started in this process.
    pub async fn start(&self, state: SyncState) -> Result<Option<UtxoSet>> {
        if state != SyncState::Synced {
            return Ok(None);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        self.build().await.map(Some)
    }

    fn restore(&self) -> Result<UtxoSnapshot> {
        if let Some(snapshot) = self.store.read_utxo_snapshot(UTXO_SNAPSHOT_ID)? {
            info!(height = snapshot.height, entries = snapshot.utxo.len(), "resuming utxo build");
            return Ok(snapshot);
        }
        let step = self
            .store
            .get_config("utxo.step")?
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_step);
        Ok(UtxoSnapshot {
            height: 0,
            step,
            utxo: UtxoSet::new(),
        })
    }

    fn checkpoint(&self, snapshot: &UtxoSnapshot) -> Result<()> {
        self.store.write_utxo_snapshot(UTXO_SNAPSHOT_ID, snapshot)?;
        self.store
            .set_config("utxo.height", serde_json::Value::from(snapshot.height))?;
        info!(height = snapshot.height, entries = snapshot.utxo.len(), "utxo checkpoint");
        Ok(())
    }

    async fn build(&self) -> Result<UtxoSet> {
        let mut snapshot = self.restore()?;
        loop {
            let low = snapshot.height;
            let headers = self
                .store
                .headers_in_height_range(low, low + snapshot.step)?;
            if headers.is_empty() {
                break;
            }

            let hashes: Vec<Hash> = headers.iter().map(|h| h.hash).collect();
            let blocks = match self.network.download_blocks(hashes).await {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!(height = low, error = %e, "block download failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                    continue;
                }
            };
            let decoded: Result<Vec<Block>> = blocks
                .iter()
                .map(|block| self.decoder.decode_block(&block.raw))
                .collect();
            let decoded = match decoded {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(height = low, error = %e, "block decoding failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                    continue;
                }
            };

            for (header, block) in headers.iter().zip(&decoded) {
                let stats = snapshot.utxo.apply_block(block);
                debug!(
                    height = header.height,
                    created = stats.created,
                    spent = stats.spent,
                    missing = stats.missing,
                    "applied block"
                );
            }

            snapshot.height += headers.len() as u64;
            if low / self.checkpoint_interval != snapshot.height / self.checkpoint_interval {
                self.checkpoint(&snapshot)?;
            }
        }
        self.checkpoint(&snapshot)?;
        info!(height = snapshot.height, entries = snapshot.utxo.len(), "utxo set built");
        Ok(snapshot.utxo)
    }
}
