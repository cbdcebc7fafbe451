//! Protocol and node constants

use std::time::Duration;

// ============================================================================
// WIRE PROTOCOL
// ============================================================================

/// Mainnet network magic, as it appears on the wire
pub const MAINNET_MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Protocol version advertised in our version message
pub const PROTOCOL_VERSION: i32 = 70015;

/// First protocol version whose addr entries carry a timestamp
pub const MIN_ADDR_TIMESTAMP_VERSION: i32 = 31402;

/// Size of the fixed frame header: magic, command, length, checksum
pub const FRAME_HEADER_SIZE: usize = 24;

/// Width of the NUL-padded command field
pub const COMMAND_SIZE: usize = 12;

/// Serialized block header size
pub const HEADER_SIZE: usize = 80;

/// Largest payload we are willing to buffer: 32 MiB
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024 * 1024;

/// Maximum addresses accepted in one addr message
pub const MAX_ADDR_ENTRIES: usize = 1000;

/// Maximum inventory vectors accepted in one inv/getdata message
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum headers accepted in one headers message
pub const MAX_HEADERS_ENTRIES: usize = 2000;

/// Inventory type for a full block
pub const INV_TYPE_BLOCK: u32 = 2;

/// Service bits we advertise (none: we serve nothing)
pub const LOCAL_SERVICES: u64 = 0;

/// User agent announced to peers
pub const USER_AGENT: &str = "/lightnode:0.1.0/";

/// Default mainnet P2P port
pub const DEFAULT_PORT: u16 = 8333;

// ============================================================================
// GENESIS
// ============================================================================

/// Serialized mainnet genesis header
pub const GENESIS_HEADER_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

/// Mainnet genesis hash in display (reversed) order
pub const GENESIS_HASH_HEX: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

// ============================================================================
// PEER POOL
// ============================================================================

/// Target number of handshaken peers
pub const MAX_ACTIVE_PEERS: usize = 40;

/// Keep asking for addresses until this many are known
pub const ADDRESS_BOOK_TARGET: usize = 500;

/// Number of peers each block request is sent to
pub const DOWNLOAD_FANOUT: usize = 6;

/// TCP connect deadline
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Deadline for a connected peer to complete the version/verack exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a whole block-download batch
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the acquisition loop waits for an addr reply
pub const ADDR_WAIT: Duration = Duration::from_secs(2);

/// Pause between acquisition rounds when there is nothing to do
pub const ACQUIRE_IDLE: Duration = Duration::from_millis(250);

/// First delay before redialing a seed that failed or dropped
pub const SEED_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Seed redial delays double up to this
pub const SEED_RETRY_MAX: Duration = Duration::from_secs(60);

// ============================================================================
// CHAIN SYNC AND UTXO
// ============================================================================

/// getheaders watchdog
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(10);

/// A tip newer than this (seconds) counts as caught up
pub const SYNC_RECENCY_SECS: u64 = 3600;

/// Default number of heights fetched per UTXO step
pub const DEFAULT_UTXO_STEP: u64 = 4;

/// UTXO snapshot interval in blocks
pub const UTXO_CHECKPOINT_INTERVAL: u64 = 1000;

/// Delay before retrying a failed UTXO range
pub const UTXO_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Snapshot id for the UTXO checkpoint
pub const UTXO_SNAPSHOT_ID: &str = "utxo";
