//! Header-chain synchronization
//!
//! The engine owns the chain tip. Headers are accepted only when they link to
//! the current tip; everything else is dropped and the watchdog asks again.

use crate::constants::{HEADERS_TIMEOUT, INV_TYPE_BLOCK, SYNC_RECENCY_SECS};
use crate::error::{NodeError, Result};
use crate::network::{InboundMessage, PeerNetwork};
use crate::message::NetworkMessage;
use crate::store::Store;
use crate::types::*;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Synced,
}

/// Read-only view of the chain published to other components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    pub height: u64,
    pub tip: Hash,
    pub state: SyncState,
}

/// An outstanding getheaders and when to give up on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRequest {
    pub from: Hash,
    pub deadline: Instant,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct ChainSync {
    store: Arc<dyn Store>,
    network: Arc<dyn PeerNetwork>,
    tip: StoredHeader,
    state: SyncState,
    pending: Option<HeaderRequest>,
    watchdog: Duration,
    status: watch::Sender<ChainStatus>,
    synced_trigger: Option<oneshot::Sender<()>>,
}

impl ChainSync {
    /// Load the persisted tip, seeding the store with genesis when it is empty
    pub fn open(store: Arc<dyn Store>, network: Arc<dyn PeerNetwork>) -> Result<Self> {
        let tip = match store.latest_header()? {
            Some(tip) => tip,
            None => {
                let genesis = StoredHeader::new(0, BlockHeader::genesis()?);
                store.append_header(genesis.clone())?;
                info!(hash = %to_display_hex(&genesis.hash), "seeded store with genesis header");
                genesis
            }
        };
        info!(height = tip.height, tip = %to_display_hex(&tip.hash), "chain loaded");

        let (status, _) = watch::channel(ChainStatus {
            height: tip.height,
            tip: tip.hash,
            state: SyncState::Unsynced,
        });
        Ok(ChainSync {
            store,
            network,
            tip,
            state: SyncState::Unsynced,
            pending: None,
            watchdog: HEADERS_TIMEOUT,
            status,
            synced_trigger: None,
        })
    }

    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn tip(&self) -> &StoredHeader {
        &self.tip
    }

    pub fn height(&self) -> u64 {
        self.tip.height
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn pending_request(&self) -> Option<HeaderRequest> {
        self.pending
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            height: self.tip.height,
            tip: self.tip.hash,
            state: self.state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainStatus> {
        self.status.subscribe()
    }

    /// Fires once, the first time the chain reaches `Synced`
    pub fn on_synced(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.synced_trigger = Some(tx);
        rx
    }

    fn publish(&self) {
        self.status.send_replace(self.status());
    }

    /// Append every header that links to the tip, in order. Returns how many
    /// were accepted.
    pub fn apply_headers(&mut self, headers: &[BlockHeader]) -> Result<usize> {
        let mut applied = 0;
        for header in headers {
            if header.prev_block_hash != self.tip.hash {
                debug!(
                    hash = %to_display_hex(&header.hash()),
                    prev = %to_display_hex(&header.prev_block_hash),
                    "header does not link to tip"
                );
                continue;
            }
            let stored = StoredHeader::new(self.tip.height + 1, *header);
            self.store.append_header(stored.clone())?;
            self.tip = stored;
            applied += 1;
        }
        if applied > 0 {
            self.publish();
        }
        Ok(applied)
    }

    /// Ask the network for headers following the current tip and arm the watchdog
    pub async fn request_headers(&mut self) -> Result<()> {
        let from = self.tip.hash;
        self.network.request_headers(from).await?;
        self.pending = Some(HeaderRequest {
            from,
            deadline: Instant::now() + self.watchdog,
        });
        debug!(height = self.tip.height, "requested headers");
        Ok(())
    }

    fn mark_synced(&mut self) {
        self.pending = None;
        if self.state == SyncState::Synced {
            return;
        }
        self.state = SyncState::Synced;
        self.publish();
        info!(height = self.tip.height, tip = %to_display_hex(&self.tip.hash), "chain synced");
        if let Some(trigger) = self.synced_trigger.take() {
            let _ = trigger.send(());
        }
    }

    /// Process one headers batch. `now` is unix seconds.
    pub async fn handle_headers(&mut self, headers: &[BlockHeader], now: u64) -> Result<()> {
        let applied = self.apply_headers(headers)?;
        let caught_up = match headers.last() {
            None => true,
            Some(last) => now.saturating_sub(last.timestamp as u64) <= SYNC_RECENCY_SECS,
        };
        debug!(received = headers.len(), applied, height = self.tip.height, "headers batch");
        if caught_up {
            self.mark_synced();
            Ok(())
        } else {
            self.request_headers().await
        }
    }

    /// A block announcement we do not have knocks us back to `Unsynced`
    pub async fn handle_inv(&mut self, items: &[InventoryVector]) -> Result<()> {
        if self.state != SyncState::Synced {
            return Ok(());
        }
        let announced = items
            .iter()
            .find(|item| item.inv_type == INV_TYPE_BLOCK && item.hash != self.tip.hash);
        if let Some(item) = announced {
            info!(block = %to_display_hex(&item.hash), "new block announced");
            self.state = SyncState::Unsynced;
            self.publish();
            self.request_headers().await?;
        }
        Ok(())
    }

    /// Resend the outstanding request if nothing moved since it was sent
    pub async fn handle_watchdog(&mut self) -> Result<()> {
        let Some(request) = self.pending.take() else {
            return Ok(());
        };
        if self.state == SyncState::Unsynced && request.from == self.tip.hash {
            warn!(height = self.tip.height, "no headers before deadline, asking again");
            self.request_headers().await?;
        }
        Ok(())
    }

    /// Drive the engine from the network's headers and inv subscriptions
    pub async fn run(
        mut self,
        mut headers: mpsc::UnboundedReceiver<InboundMessage>,
        mut invs: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Result<()> {
        self.request_headers().await?;
        loop {
            let deadline = self.pending.map(|request| request.deadline);
            tokio::select! {
                inbound = headers.recv() => match inbound {
                    Some(InboundMessage { message: NetworkMessage::Headers(batch), .. }) => {
                        self.handle_headers(&batch, unix_now()).await?
                    }
                    Some(_) => {}
                    None => return Err(NodeError::Shutdown),
                },
                inbound = invs.recv() => match inbound {
                    Some(InboundMessage { message: NetworkMessage::Inv(items), .. }) => {
                        self.handle_inv(&items).await?
                    }
                    Some(_) => {}
                    None => return Err(NodeError::Shutdown),
                },
                _ = watchdog(deadline) => self.handle_watchdog().await?,
            }
        }
    }
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
