//! A single peer connection: socket tasks, handshake state and counters

use crate::codec::{encode_message, FrameDecoder};
use crate::constants::CONNECT_TIMEOUT;
use crate::error::{NodeError, Result};
use crate::message::{Command, NetworkMessage};
use crate::types::PeerAddress;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Disconnected,
    Connecting,
    /// Connected and our version is out; waiting for theirs
    AwaitingHandshake,
    /// Their version arrived; waiting for verack
    Handshaking,
    Active,
}

/// Per-command message counters
#[derive(Debug, Default, Clone)]
pub struct PeerStats {
    sent: HashMap<Command, u64>,
    received: HashMap<Command, u64>,
}

impl PeerStats {
    pub fn record_sent(&mut self, command: Command) {
        *self.sent.entry(command).or_insert(0) += 1;
    }

    pub fn record_received(&mut self, command: Command) {
        *self.received.entry(command).or_insert(0) += 1;
    }

    pub fn sent(&self, command: Command) -> u64 {
        self.sent.get(&command).copied().unwrap_or(0)
    }

    pub fn received(&self, command: Command) -> u64 {
        self.received.get(&command).copied().unwrap_or(0)
    }

    /// Responses received per request sent, for a response command such as
    /// `headers`. Neutral (1.0) until more than three responses were seen.
    pub fn trust_score(&self, response: Command) -> f64 {
        let Some(request) = response.request_for() else {
            return 1.0;
        };
        let requests = self.sent(request);
        let responses = self.received(response);
        if requests > 0 && responses > 3 {
            responses as f64 / requests as f64
        } else {
            1.0
        }
    }
}

/// What we know about the remote end
#[derive(Debug, Clone)]
pub struct PeerState {
    pub address: PeerAddress,
    pub stage: HandshakeStage,
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    pub stats: PeerStats,
}

impl PeerState {
    pub fn new(address: PeerAddress) -> Self {
        PeerState {
            address,
            stage: HandshakeStage::Disconnected,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
            stats: PeerStats::default(),
        }
    }
}

/// Protocol-level reaction to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkResponse {
    Ok,
    SendMessage(NetworkMessage),
    SendMessages(Vec<NetworkMessage>),
    Reject(String),
}

/// Apply the handshake and keepalive rules for one inbound message
pub fn process_message(message: &NetworkMessage, state: &mut PeerState) -> NetworkResponse {
    match message {
        NetworkMessage::Version(version) => {
            if matches!(state.stage, HandshakeStage::Handshaking | HandshakeStage::Active) {
                return NetworkResponse::Reject("duplicate version message".to_string());
            }
            state.version = version.version;
            state.services = version.services;
            state.user_agent = version.user_agent.clone();
            state.start_height = version.start_height;
            state.relay = version.relay;
            state.stage = HandshakeStage::Handshaking;
            NetworkResponse::SendMessages(vec![NetworkMessage::VerAck, NetworkMessage::SendHeaders])
        }
        NetworkMessage::VerAck => {
            state.stage = HandshakeStage::Active;
            NetworkResponse::SendMessage(NetworkMessage::GetAddr)
        }
        NetworkMessage::Ping(nonce) => NetworkResponse::SendMessage(NetworkMessage::Pong(*nonce)),
        _ => NetworkResponse::Ok,
    }
}

/// Event reported by a peer's reader task to the network manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Message { peer: PeerAddress, message: NetworkMessage },
    Disconnected { peer: PeerAddress, reason: String },
}

fn lock_state(state: &Mutex<PeerState>) -> MutexGuard<'_, PeerState> {
    // the state holds counters only, so a panic mid-update leaves nothing to repair
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable sending side of a connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    address: PeerAddress,
    outbound: mpsc::UnboundedSender<NetworkMessage>,
    state: Arc<Mutex<PeerState>>,
}

impl PeerHandle {
    fn new(address: PeerAddress, outbound: mpsc::UnboundedSender<NetworkMessage>) -> Self {
        PeerHandle {
            address,
            outbound,
            state: Arc::new(Mutex::new(PeerState::new(address))),
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Queue a message for the writer task
    pub fn send(&self, message: NetworkMessage) -> Result<()> {
        let command = message.command();
        self.outbound
            .send(message)
            .map_err(|_| NodeError::Connection(format!("{} is closed", self.address)))?;
        lock_state(&self.state).stats.record_sent(command);
        trace!(peer = %self.address, %command, "queued");
        Ok(())
    }

    pub fn stage(&self) -> HandshakeStage {
        lock_state(&self.state).stage
    }

    fn set_stage(&self, stage: HandshakeStage) {
        lock_state(&self.state).stage = stage;
    }

    pub fn state(&self) -> PeerState {
        lock_state(&self.state).clone()
    }

    pub fn trust_score(&self, response: Command) -> f64 {
        lock_state(&self.state).stats.trust_score(response)
    }

    /// Count an inbound message and apply the protocol rules to it
    fn receive(&self, message: &NetworkMessage) -> NetworkResponse {
        let mut state = lock_state(&self.state);
        state.stats.record_received(message.command());
        process_message(message, &mut state)
    }
}

/// A live connection. Dropping it aborts the socket tasks.
#[derive(Debug)]
pub struct PeerConnection {
    handle: PeerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerConnection {
    /// Connect within the connect deadline and start the reader and writer tasks
    pub async fn connect(
        address: PeerAddress,
        magic: [u8; 4],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(address, outbound);
        handle.set_stage(HandshakeStage::Connecting);

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address.socket_addr()))
            .await
            .map_err(|_| NodeError::Timeout(format!("connecting to {}", address)))?
            .map_err(|e| NodeError::Connection(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        handle.set_stage(HandshakeStage::AwaitingHandshake);
        debug!(peer = %address, "connected");
        let writer = tokio::spawn(write_loop(write_half, outbound_rx, magic, address));
        let reader = tokio::spawn(read_loop(read_half, magic, handle.clone(), events));
        Ok(PeerConnection {
            handle,
            tasks: vec![reader, writer],
        })
    }

    /// A connection with no socket behind it: outbound messages land in the
    /// returned receiver. Used to drive the pool without real peers.
    pub fn detached(address: PeerAddress) -> (Self, mpsc::UnboundedReceiver<NetworkMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(address, outbound);
        handle.set_stage(HandshakeStage::AwaitingHandshake);
        (
            PeerConnection {
                handle,
                tasks: Vec::new(),
            },
            outbound_rx,
        )
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    pub fn address(&self) -> PeerAddress {
        self.handle.address
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.handle.set_stage(HandshakeStage::Disconnected);
    }
}

async fn write_loop(
    mut socket: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<NetworkMessage>,
    magic: [u8; 4],
    address: PeerAddress,
) {
    while let Some(message) = outbound.recv().await {
        let frame = encode_message(magic, &message);
        if let Err(e) = socket.write_all(&frame).await {
            debug!(peer = %address, error = %e, "write failed");
            break;
        }
    }
}

async fn read_loop(
    mut socket: OwnedReadHalf,
    magic: [u8; 4],
    handle: PeerHandle,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let address = handle.address;
    let mut decoder = FrameDecoder::new(magic);
    let mut buf = vec![0u8; READ_CHUNK];
    let reason = loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) => break "closed by peer".to_string(),
            Ok(n) => n,
            Err(e) => break e.to_string(),
        };
        let messages = match decoder.feed(&buf[..n]) {
            Ok(messages) => messages,
            Err(e) => break e.to_string(),
        };
        if let Some(reason) = deliver(&handle, &events, messages) {
            break reason;
        }
    };
    debug!(peer = %address, %reason, "peer disconnected");
    handle.set_stage(HandshakeStage::Disconnected);
    let _ = events.send(PeerEvent::Disconnected {
        peer: address,
        reason,
    });
}

/// Reply to and forward decoded messages; returns a reason to hang up, if any
fn deliver(
    handle: &PeerHandle,
    events: &mpsc::UnboundedSender<PeerEvent>,
    messages: Vec<NetworkMessage>,
) -> Option<String> {
    for message in messages {
        let replies = match handle.receive(&message) {
            NetworkResponse::Ok => Vec::new(),
            NetworkResponse::SendMessage(reply) => vec![reply],
            NetworkResponse::SendMessages(replies) => replies,
            NetworkResponse::Reject(reason) => return Some(reason),
        };
        for reply in replies {
            if let Err(e) = handle.send(reply) {
                return Some(e.to_string());
            }
        }
        let event = PeerEvent::Message {
            peer: handle.address,
            message,
        };
        if events.send(event).is_err() {
            return Some("network manager gone".to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_message;
    use crate::constants::MAINNET_MAGIC;
    use crate::message::VersionMessage;
    use tokio::net::TcpListener;

    fn address() -> PeerAddress {
        PeerAddress::new("127.0.0.1".parse().unwrap(), 8333)
    }

    fn version() -> VersionMessage {
        VersionMessage::outbound(&address(), 1_700_000_000, 42, 800_000)
    }

    #[test]
    fn test_version_replies_verack_and_sendheaders() {
        let mut state = PeerState::new(address());
        let response = process_message(&NetworkMessage::Version(version()), &mut state);
        assert_eq!(
            response,
            NetworkResponse::SendMessages(vec![NetworkMessage::VerAck, NetworkMessage::SendHeaders])
        );
        assert_eq!(state.stage, HandshakeStage::Handshaking);
        assert_eq!(state.start_height, 800_000);
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut state = PeerState::new(address());
        process_message(&NetworkMessage::Version(version()), &mut state);
        let response = process_message(&NetworkMessage::Version(version()), &mut state);
        assert!(matches!(response, NetworkResponse::Reject(_)));
    }

    #[test]
    fn test_verack_activates_and_asks_for_addresses() {
        let mut state = PeerState::new(address());
        let response = process_message(&NetworkMessage::VerAck, &mut state);
        assert_eq!(response, NetworkResponse::SendMessage(NetworkMessage::GetAddr));
        assert_eq!(state.stage, HandshakeStage::Active);
    }

    #[test]
    fn test_ping_echoes_nonce() {
        let mut state = PeerState::new(address());
        let response = process_message(&NetworkMessage::Ping(77), &mut state);
        assert_eq!(response, NetworkResponse::SendMessage(NetworkMessage::Pong(77)));
    }

    #[test]
    fn test_trust_score() {
        let mut stats = PeerStats::default();
        assert_eq!(stats.trust_score(Command::Headers), 1.0);
        for _ in 0..8 {
            stats.record_sent(Command::GetHeaders);
        }
        for _ in 0..3 {
            stats.record_received(Command::Headers);
        }
        // three responses is not enough evidence yet
        assert_eq!(stats.trust_score(Command::Headers), 1.0);
        stats.record_received(Command::Headers);
        assert_eq!(stats.trust_score(Command::Headers), 0.5);
        assert_eq!(stats.trust_score(Command::Inv), 1.0);
    }

    #[test]
    fn test_handle_counts_sent_messages() {
        let (conn, mut rx) = PeerConnection::detached(address());
        conn.handle().send(NetworkMessage::Ping(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), NetworkMessage::Ping(1));
        assert_eq!(conn.handle().state().stats.sent(Command::Ping), 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddress::from(listener.local_addr().unwrap());
        drop(listener);
        let (events, _rx) = mpsc::unbounded_channel();
        let result = PeerConnection::connect(addr, MAINNET_MAGIC, events).await;
        assert!(result.unwrap_err().is_peer_fault());
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddress::from(listener.local_addr().unwrap());
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::connect(addr, MAINNET_MAGIC, events).await.unwrap();
        let (mut remote, _) = listener.accept().await.unwrap();

        let mut bytes = encode_message(MAINNET_MAGIC, &NetworkMessage::Version(version()));
        bytes.extend(encode_message(MAINNET_MAGIC, &NetworkMessage::VerAck));
        remote.write_all(&bytes).await.unwrap();

        let first = events_rx.recv().await.unwrap();
        assert!(matches!(first, PeerEvent::Message { message: NetworkMessage::Version(_), .. }));
        let second = events_rx.recv().await.unwrap();
        assert!(matches!(second, PeerEvent::Message { message: NetworkMessage::VerAck, .. }));
        assert_eq!(conn.handle().stage(), HandshakeStage::Active);

        // verack, sendheaders, getaddr came back over the socket
        let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
        let mut replies = Vec::new();
        let mut buf = [0u8; 1024];
        while replies.len() < 3 {
            let n = remote.read(&mut buf).await.unwrap();
            replies.extend(decoder.feed(&buf[..n]).unwrap());
        }
        assert_eq!(
            replies,
            vec![NetworkMessage::VerAck, NetworkMessage::SendHeaders, NetworkMessage::GetAddr]
        );

        drop(remote);
        let closed = events_rx.recv().await.unwrap();
        assert!(matches!(closed, PeerEvent::Disconnected { .. }));
    }
}
