//! Peer pool, message dispatch and block downloads
//!
//! One [`NetworkManager`] per process owns every connection. Peer reader tasks
//! report into a single event channel; [`NetworkManager::run`] consumes it,
//! keeps the pool's bookkeeping and forwards messages to subscribers.

use crate::constants::*;
use crate::download::DownloadBatch;
use crate::error::{NodeError, Result};
use crate::message::{BlockMessage, Command, NetworkMessage, TimestampedAddress, VersionMessage};
use crate::peer::{PeerConnection, PeerEvent, PeerHandle};
use crate::types::{Hash, PeerAddress};
use async_trait::async_trait;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// The two requests chain sync and the UTXO builder make of the network
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Send getheaders anchored at `from` to one connected peer
    async fn request_headers(&self, from: Hash) -> Result<()>;

    /// Fetch full blocks, returned in the order requested
    async fn download_blocks(&self, hashes: Vec<Hash>) -> Result<Vec<BlockMessage>>;
}

/// A decoded message and the peer it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer: PeerAddress,
    pub message: NetworkMessage,
}

/// Pool sizing and protocol parameters
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub magic: [u8; 4],
    pub max_active: usize,
    pub address_book_target: usize,
    pub download_fanout: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            magic: MAINNET_MAGIC,
            max_active: MAX_ACTIVE_PEERS,
            address_book_target: ADDRESS_BOOK_TARGET,
            download_fanout: DOWNLOAD_FANOUT,
        }
    }
}

struct PendingPeer {
    connection: PeerConnection,
    deadline: Instant,
}

/// Redial schedule for a seed. Seeds are never forgotten.
struct SeedRetry {
    next_attempt: Instant,
    backoff: Duration,
}

#[derive(Default)]
struct PoolState {
    known: HashMap<IpAddr, PeerAddress>,
    pending: HashMap<IpAddr, PendingPeer>,
    active: HashMap<IpAddr, PeerConnection>,
    seeds: HashMap<IpAddr, SeedRetry>,
    batch: Option<DownloadBatch>,
    next_batch_id: u64,
    subscribers: HashMap<Command, mpsc::UnboundedSender<InboundMessage>>,
    wildcard: Option<mpsc::UnboundedSender<InboundMessage>>,
}

impl PoolState {
    fn is_connected(&self, ip: &IpAddr) -> bool {
        self.active.contains_key(ip) || self.pending.contains_key(ip)
    }

    /// Not connected, and not a seed still waiting out its backoff
    fn is_dialable(&self, ip: &IpAddr, now: Instant) -> bool {
        !self.is_connected(ip) && self.seeds.get(ip).map_or(true, |s| s.next_attempt <= now)
    }
}

struct Inner {
    settings: PoolSettings,
    state: Mutex<PoolState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    active_count: watch::Sender<usize>,
    known_count: watch::Sender<usize>,
    ready: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl NetworkManager {
    pub fn new(settings: PoolSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (active_count, _) = watch::channel(0);
        let (known_count, _) = watch::channel(0);
        let (ready, _) = watch::channel(false);
        NetworkManager {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(PoolState::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                active_count,
                known_count,
                ready,
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Receive every inbound message with `command`. A later subscription to
    /// the same command replaces the earlier one.
    pub async fn subscribe(&self, command: Command) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().await.subscribers.insert(command, tx);
        rx
    }

    /// Receive every inbound message regardless of command
    pub async fn subscribe_all(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().await.wildcard = Some(tx);
        rx
    }

    // ------------------------------------------------------------------
    // Pool inspection
    // ------------------------------------------------------------------

    pub fn active_count(&self) -> usize {
        *self.inner.active_count.borrow()
    }

    pub fn known_count(&self) -> usize {
        *self.inner.known_count.borrow()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Resolves once the pool first reaches its target size
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready.subscribe();
        while !*rx.borrow_and_update() {
            rx.changed().await.map_err(|_| NodeError::Shutdown)?;
        }
        Ok(())
    }

    pub async fn active_peers(&self) -> Vec<PeerHandle> {
        let state = self.inner.state.lock().await;
        state.active.values().map(|c| c.handle().clone()).collect()
    }

    fn publish_counts(&self, state: &PoolState) {
        self.inner.active_count.send_replace(state.active.len());
        self.inner.known_count.send_replace(state.known.len());
        if state.active.len() >= self.inner.settings.max_active && !self.is_ready() {
            info!(peers = state.active.len(), "network ready");
            self.inner.ready.send_replace(true);
        }
    }

    /// A uniformly random active peer, waiting for one if the pool is empty
    pub async fn pick_active_peer(&self) -> Result<PeerHandle> {
        let mut peers = self.pick_active_peers(1).await?;
        peers.pop().ok_or(NodeError::Shutdown)
    }

    /// Up to `n` distinct random active peers, at least one. Waits while the
    /// pool is empty.
    pub async fn pick_active_peers(&self, n: usize) -> Result<Vec<PeerHandle>> {
        let mut count_rx = self.inner.active_count.subscribe();
        loop {
            {
                let state = self.inner.state.lock().await;
                if !state.active.is_empty() {
                    let mut rng = rand::thread_rng();
                    let picked = state
                        .active
                        .values()
                        .choose_multiple(&mut rng, n.max(1))
                        .into_iter()
                        .map(|c| c.handle().clone())
                        .collect();
                    return Ok(picked);
                }
            }
            count_rx.changed().await.map_err(|_| NodeError::Shutdown)?;
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Record the seed address and try it once.
    ///
    /// A seed stays in the address book when it fails or drops; the
    /// acquisition loop redials it with exponential backoff.
    pub async fn add_seed(&self, address: PeerAddress) {
        {
            let mut state = self.inner.state.lock().await;
            state.known.insert(address.ip, address);
            state.seeds.insert(
                address.ip,
                SeedRetry {
                    next_attempt: Instant::now(),
                    backoff: SEED_RETRY_BACKOFF,
                },
            );
            self.publish_counts(&state);
        }
        if let Err(e) = self.connect_peer(address).await {
            warn!(peer = %address, error = %e, "seed unreachable, will retry");
            self.ban(&address, &e.to_string()).await;
        }
    }

    /// Open a connection, track it as pending and announce our version
    async fn connect_peer(&self, address: PeerAddress) -> Result<()> {
        let connection =
            PeerConnection::connect(address, self.inner.settings.magic, self.inner.events_tx.clone()).await?;
        let handle = connection.handle().clone();
        // registered before version goes out; the verack may beat the send
        self.register_pending(connection).await;
        let nonce = rand::thread_rng().gen();
        let version = VersionMessage::outbound(&address, unix_now(), nonce, 0);
        handle.send(NetworkMessage::Version(version))
    }

    pub(crate) async fn register_pending(&self, connection: PeerConnection) {
        let mut state = self.inner.state.lock().await;
        let address = connection.address();
        state.known.entry(address.ip).or_insert(address);
        state.pending.insert(
            address.ip,
            PendingPeer {
                connection,
                deadline: Instant::now() + HANDSHAKE_TIMEOUT,
            },
        );
        self.publish_counts(&state);
    }

    /// Drop any connection to an address and forget it. Seeds are kept and
    /// scheduled for a later redial instead.
    pub async fn ban(&self, address: &PeerAddress, reason: &str) {
        let mut state = self.inner.state.lock().await;
        match state.seeds.get_mut(&address.ip) {
            Some(retry) => {
                let delay = retry.backoff;
                retry.next_attempt = Instant::now() + delay;
                retry.backoff = (delay * 2).min(SEED_RETRY_MAX);
                debug!(peer = %address, retry_in = ?delay, "seed redial scheduled");
            }
            None => {
                state.known.remove(&address.ip);
            }
        }
        let pending = state.pending.remove(&address.ip);
        let active = state.active.remove(&address.ip);
        if pending.is_some() || active.is_some() {
            debug!(peer = %address, reason, "dropped peer");
        }
        self.publish_counts(&state);
    }

    /// Move a peer whose verack arrived into the active set, unless full
    async fn promote(&self, address: &PeerAddress) {
        let mut state = self.inner.state.lock().await;
        let Some(pending) = state.pending.remove(&address.ip) else {
            return;
        };
        if state.active.len() >= self.inner.settings.max_active {
            debug!(peer = %address, "pool full, disconnecting");
        } else {
            debug!(peer = %address, active = state.active.len() + 1, "peer active");
            state.active.insert(address.ip, pending.connection);
            if let Some(retry) = state.seeds.get_mut(&address.ip) {
                retry.backoff = SEED_RETRY_BACKOFF;
            }
        }
        self.publish_counts(&state);
    }

    async fn merge_addresses(&self, entries: &[TimestampedAddress]) {
        let mut state = self.inner.state.lock().await;
        let before = state.known.len();
        for entry in entries {
            let address = PeerAddress::from(&entry.address);
            if address.port == 0 || address.ip.is_unspecified() {
                continue;
            }
            state.known.entry(address.ip).or_insert(address);
        }
        if state.known.len() > before {
            debug!(added = state.known.len() - before, known = state.known.len(), "learned addresses");
        }
        self.publish_counts(&state);
    }

    async fn expire_handshakes(&self) {
        let now = Instant::now();
        let expired: Vec<PeerAddress> = {
            let state = self.inner.state.lock().await;
            state
                .pending
                .values()
                .filter(|p| p.deadline <= now)
                .map(|p| p.connection.address())
                .collect()
        };
        for address in expired {
            self.ban(&address, "handshake timed out").await;
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    pub(crate) async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer, message } => {
                match &message {
                    NetworkMessage::VerAck => self.promote(&peer).await,
                    NetworkMessage::Addr(entries) => self.merge_addresses(entries).await,
                    NetworkMessage::Block(block) => self.accept_block(block).await,
                    _ => {}
                }
                self.dispatch(InboundMessage { peer, message }).await;
            }
            PeerEvent::Disconnected { peer, reason } => self.ban(&peer, &reason).await,
        }
    }

    async fn accept_block(&self, block: &BlockMessage) {
        let mut state = self.inner.state.lock().await;
        let Some(batch) = state.batch.as_mut() else {
            return;
        };
        if batch.fill(block.clone()) && batch.is_complete() {
            debug!(batch = batch.id(), blocks = batch.requested().len(), "download batch complete");
            state.batch = None;
        }
    }

    async fn dispatch(&self, inbound: InboundMessage) {
        let mut state = self.inner.state.lock().await;
        let command = inbound.message.command();
        if let Some(tx) = state.subscribers.get(&command) {
            if tx.send(inbound.clone()).is_err() {
                state.subscribers.remove(&command);
            }
        }
        if let Some(tx) = &state.wildcard {
            if tx.send(inbound).is_err() {
                state.wildcard = None;
            }
        }
    }

    /// Grow the pool towards its target. Runs forever.
    ///
    /// Each round first expires stale handshakes. Below the cap it then asks
    /// one active peer for addresses while the book is under target, and
    /// dials one random dialable address. Address requests and connects are
    /// interleaved from the first round; dialing does not wait for the book
    /// to fill.
    async fn acquire(self) {
        loop {
            self.expire_handshakes().await;
            let (connected, known, asker, candidate) = {
                let state = self.inner.state.lock().await;
                let now = Instant::now();
                let mut rng = rand::thread_rng();
                let asker = state.active.values().choose(&mut rng).map(|c| c.handle().clone());
                let candidate = state
                    .known
                    .values()
                    .filter(|a| state.is_dialable(&a.ip, now))
                    .choose(&mut rng)
                    .copied();
                (state.active.len() + state.pending.len(), state.known.len(), asker, candidate)
            };

            if connected >= self.inner.settings.max_active {
                tokio::time::sleep(ACQUIRE_IDLE).await;
                continue;
            }

            if known < self.inner.settings.address_book_target {
                if let Some(peer) = asker {
                    let mut known_rx = self.inner.known_count.subscribe();
                    known_rx.borrow_and_update();
                    if peer.send(NetworkMessage::GetAddr).is_ok() {
                        let _ = timeout(ADDR_WAIT, known_rx.changed()).await;
                    }
                }
            }

            match candidate {
                Some(address) => {
                    if let Err(e) = self.connect_peer(address).await {
                        debug!(peer = %address, error = %e, "connect failed");
                        self.ban(&address, &e.to_string()).await;
                    }
                }
                None => tokio::time::sleep(ACQUIRE_IDLE).await,
            }
        }
    }

    /// Run peer acquisition and the event loop until every sender is gone
    pub async fn run(&self) -> Result<()> {
        let mut events = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| NodeError::Connection("network manager already running".to_string()))?;
        let acquisition = tokio::spawn(self.clone().acquire());
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        acquisition.abort();
        warn!("peer event channel closed");
        Err(NodeError::Shutdown)
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Request `hashes` from several peers each and wait for all of them.
    ///
    /// Starting a download supersedes any batch still in flight. The whole
    /// batch fails with `DownloadTimeout` if it is not complete in time.
    pub async fn download_blocks(&self, hashes: Vec<Hash>) -> Result<Vec<BlockMessage>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let requested = hashes.len();
        let deadline = Instant::now() + DOWNLOAD_TIMEOUT;
        let (id, done) = {
            let mut state = self.inner.state.lock().await;
            state.next_batch_id += 1;
            let id = state.next_batch_id;
            let (batch, done) = DownloadBatch::new(id, hashes.clone());
            if let Some(previous) = state.batch.replace(batch) {
                debug!(batch = previous.id(), "superseded download batch");
            }
            (id, done)
        };

        let mut seen = HashSet::new();
        for hash in hashes.iter().filter(|h| seen.insert(**h)) {
            let peers = match timeout_at(deadline, self.pick_active_peers(self.inner.settings.download_fanout)).await {
                Ok(peers) => peers?,
                Err(_) => break,
            };
            for peer in peers {
                if let Err(e) = peer.send(NetworkMessage::get_block(*hash)) {
                    debug!(peer = %peer.address(), error = %e, "getdata not sent");
                }
            }
        }

        match timeout_at(deadline, done).await {
            Ok(Ok(blocks)) => Ok(blocks),
            Ok(Err(_)) => Err(NodeError::DownloadSuperseded),
            Err(_) => {
                let mut state = self.inner.state.lock().await;
                let current = state.batch.as_ref().map(|b| (b.id(), b.missing()));
                let missing = match current {
                    // only clear our own batch, never a newer one
                    Some((batch_id, missing)) if batch_id == id => {
                        state.batch = None;
                        missing
                    }
                    _ => requested,
                };
                Err(NodeError::DownloadTimeout { missing, requested })
            }
        }
    }

    /// Send getheaders from `from` to a random active peer
    pub async fn request_headers(&self, from: Hash) -> Result<()> {
        let peer = self.pick_active_peer().await?;
        peer.send(NetworkMessage::get_headers(from))
    }
}

#[async_trait]
impl PeerNetwork for NetworkManager {
    async fn request_headers(&self, from: Hash) -> Result<()> {
        NetworkManager::request_headers(self, from).await
    }

    async fn download_blocks(&self, hashes: Vec<Hash>) -> Result<Vec<BlockMessage>> {
        NetworkManager::download_blocks(self, hashes).await
    }
}
