//! Core types shared by the codec, the peer pool, chain sync and the UTXO builder

use crate::codec;
use crate::constants::GENESIS_HEADER_HEX;
use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Hash type: 256-bit hash in internal (wire) byte order
pub type Hash = [u8; 32];

/// The all-zero hash, used as the getheaders stop hash and the coinbase outpoint
pub const ZERO_HASH: Hash = [0u8; 32];

/// Render a hash the way block explorers do: byte-reversed hex
pub fn to_display_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order hex string back into an internal-order hash
pub fn from_display_hex(s: &str) -> Result<Hash> {
    let bytes = hex::decode(s).map_err(|e| NodeError::Malformed(format!("bad hash hex: {}", e)))?;
    let mut hash: Hash = bytes
        .try_into()
        .map_err(|_| NodeError::Malformed(format!("hash must be 32 bytes: {}", s)))?;
    hash.reverse();
    Ok(hash)
}

/// Serde adapter storing hashes as display-order hex strings
pub mod display_hash {
    use super::{from_display_hex, to_display_hex, Hash};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_display_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        from_display_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// HEADERS
// ============================================================================

/// Block Header: the 80-byte proof-of-work header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    #[serde(with = "display_hash")]
    pub prev_block_hash: Hash,
    #[serde(with = "display_hash")]
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte wire form
    pub fn to_bytes(&self) -> [u8; 80] {
        codec::encode_header(self)
    }

    /// Double SHA-256 of the serialized header
    pub fn hash(&self) -> Hash {
        codec::double_sha256(&self.to_bytes())
    }

    /// The hard-coded mainnet genesis header
    pub fn genesis() -> Result<Self> {
        let raw = hex::decode(GENESIS_HEADER_HEX)
            .map_err(|e| NodeError::Malformed(format!("genesis hex: {}", e)))?;
        codec::decode_header(&raw)
    }
}

/// A header as persisted: its chain height and hash alongside the header itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub height: u64,
    #[serde(with = "display_hash")]
    pub hash: Hash,
    pub header: BlockHeader,
}

impl StoredHeader {
    pub fn new(height: u64, header: BlockHeader) -> Self {
        StoredHeader {
            height,
            hash: header.hash(),
            header,
        }
    }
}

// ============================================================================
// ADDRESSES AND INVENTORY
// ============================================================================

/// A dialable peer address. Identity is the ip: one connection per ip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        PeerAddress { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::new(addr.ip(), addr.port())
    }
}

impl From<&NetworkAddress> for PeerAddress {
    fn from(addr: &NetworkAddress) -> Self {
        let v6 = Ipv6Addr::from(addr.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        PeerAddress::new(ip, addr.port)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Network address structure as carried in version and addr payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16], // IPv6, IPv4 addresses are v4-mapped
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(services: u64, address: &PeerAddress) -> Self {
        let v6 = match address.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        NetworkAddress {
            services,
            ip: v6.octets(),
            port: address.port,
        }
    }

    pub fn unspecified() -> Self {
        NetworkAddress {
            services: 0,
            ip: [0; 16],
            port: 0,
        }
    }
}

/// Inventory vector identifying an object by type and hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash,
}

// ============================================================================
// BLOCKS AND TRANSACTIONS (as produced by a BlockDecoder)
// ============================================================================

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(with = "display_hash")]
    pub prev_txid: Hash,
    pub prev_index: u32,
}

/// A spendable output: value in satoshis and its locking script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    #[serde(with = "hex_bytes")]
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub txid: Hash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Lock time, present only when non-zero
    pub timelock: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
