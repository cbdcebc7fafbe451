//! Wire message types: the closed command set and its payloads

use crate::constants::{COMMAND_SIZE, INV_TYPE_BLOCK, LOCAL_SERVICES, PROTOCOL_VERSION, USER_AGENT};
use crate::types::*;
use std::fmt;

/// Every command this node understands. Anything else is skipped on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    Version,
    VerAck,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    GetHeaders,
    GetBlocks,
    Headers,
    Block,
    SendHeaders,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::Version,
        Command::VerAck,
        Command::Ping,
        Command::Pong,
        Command::GetAddr,
        Command::Addr,
        Command::Inv,
        Command::GetData,
        Command::GetHeaders,
        Command::GetBlocks,
        Command::Headers,
        Command::Block,
        Command::SendHeaders,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::VerAck => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::GetHeaders => "getheaders",
            Command::GetBlocks => "getblocks",
            Command::Headers => "headers",
            Command::Block => "block",
            Command::SendHeaders => "sendheaders",
        }
    }

    /// Parse the NUL-padded 12-byte command field. Unknown names yield `None`.
    pub fn from_wire(field: &[u8; COMMAND_SIZE]) -> Option<Command> {
        let end = field.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        let name = std::str::from_utf8(&field[..end]).ok()?;
        Command::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    pub fn to_wire(&self) -> [u8; COMMAND_SIZE] {
        let mut field = [0u8; COMMAND_SIZE];
        let name = self.as_str().as_bytes();
        field[..name.len()].copy_from_slice(name);
        field
    }

    /// The request whose answer this command is, for trust scoring
    pub fn request_for(&self) -> Option<Command> {
        match self {
            Command::Headers => Some(Command::GetHeaders),
            Command::Addr => Some(Command::GetAddr),
            Command::Block => Some(Command::GetData),
            Command::Pong => Some(Command::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network message types for the P2P protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    VerAck,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<TimestampedAddress>),
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    GetHeaders(LocatorMessage),
    GetBlocks(LocatorMessage),
    Headers(Vec<BlockHeader>),
    Block(BlockMessage),
    SendHeaders,
}

impl NetworkMessage {
    pub fn command(&self) -> Command {
        match self {
            NetworkMessage::Version(_) => Command::Version,
            NetworkMessage::VerAck => Command::VerAck,
            NetworkMessage::Ping(_) => Command::Ping,
            NetworkMessage::Pong(_) => Command::Pong,
            NetworkMessage::GetAddr => Command::GetAddr,
            NetworkMessage::Addr(_) => Command::Addr,
            NetworkMessage::Inv(_) => Command::Inv,
            NetworkMessage::GetData(_) => Command::GetData,
            NetworkMessage::GetHeaders(_) => Command::GetHeaders,
            NetworkMessage::GetBlocks(_) => Command::GetBlocks,
            NetworkMessage::Headers(_) => Command::Headers,
            NetworkMessage::Block(_) => Command::Block,
            NetworkMessage::SendHeaders => Command::SendHeaders,
        }
    }

    /// getheaders anchored at a single locator hash, with no stop hash
    pub fn get_headers(from: Hash) -> Self {
        NetworkMessage::GetHeaders(LocatorMessage::single(from))
    }

    /// getdata for one full block
    pub fn get_block(hash: Hash) -> Self {
        NetworkMessage::GetData(vec![InventoryVector {
            inv_type: INV_TYPE_BLOCK,
            hash,
        }])
    }
}

/// Version message for initial handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Our own version announcement towards `remote`
    pub fn outbound(remote: &PeerAddress, timestamp: i64, nonce: u64, start_height: i32) -> Self {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: LOCAL_SERVICES,
            timestamp,
            addr_recv: NetworkAddress::new(0, remote),
            addr_from: NetworkAddress::unspecified(),
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay: true,
        }
    }
}

/// An addr entry: when the peer last saw the address, and the address itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetworkAddress,
}

/// Shared payload of getheaders and getblocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorMessage {
    pub version: u32,
    pub locator_hashes: Vec<Hash>,
    pub hash_stop: Hash,
}

impl LocatorMessage {
    pub fn single(from: Hash) -> Self {
        LocatorMessage {
            version: PROTOCOL_VERSION as u32,
            locator_hashes: vec![from],
            hash_stop: ZERO_HASH,
        }
    }
}

/// A block as received: raw bytes kept intact, hash of its leading header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMessage {
    pub hash: Hash,
    pub raw: Vec<u8>,
}
