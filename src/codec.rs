//! Wire codec: framing, checksums, varints and per-command payloads
//!
//! Frames are `magic(4) | command(12) | length(4 LE) | checksum(4) | payload`,
//! where the checksum is the first four bytes of the payload's double SHA-256.
//! [`FrameDecoder`] reassembles frames from an arbitrarily split byte stream.

use crate::constants::*;
use crate::error::{NodeError, Result};
use crate::message::*;
use crate::types::*;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

// ============================================================================
// PRIMITIVES
// ============================================================================

/// SHA256(SHA256(data))
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// First four bytes of the payload's double SHA-256
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode a variable-length integer
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffff_ffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}

/// Decode a variable-length integer, returning the value and the bytes consumed
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut reader = WireReader::new(bytes);
    let value = reader.read_varint()?;
    Ok((value, reader.position()))
}

pub fn encode_var_string(s: &str) -> Vec<u8> {
    let mut out = encode_varint(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

/// Decode a length-prefixed string, returning it and the bytes consumed
pub fn decode_var_string(bytes: &[u8]) -> Result<(String, usize)> {
    let mut reader = WireReader::new(bytes);
    let s = reader.read_var_string()?;
    Ok((s, reader.position()))
}

/// Serialize a header to its 80-byte wire form
pub fn encode_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&header.version.to_le_bytes());
    out[4..36].copy_from_slice(&header.prev_block_hash);
    out[36..68].copy_from_slice(&header.merkle_root);
    out[68..72].copy_from_slice(&header.timestamp.to_le_bytes());
    out[72..76].copy_from_slice(&header.bits.to_le_bytes());
    out[76..80].copy_from_slice(&header.nonce.to_le_bytes());
    out
}

/// Parse the leading 80 bytes as a header
pub fn decode_header(bytes: &[u8]) -> Result<BlockHeader> {
    WireReader::new(bytes).read_header()
}

/// Cursor over a byte slice with the little-endian readers the protocol needs
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        WireReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(NodeError::Truncated(format!(
                "need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Ports are the one big-endian field on the wire
    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.read_array()
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16_le()? as u64),
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    pub fn read_var_string(&mut self) -> Result<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_header(&mut self) -> Result<BlockHeader> {
        Ok(BlockHeader {
            version: self.read_i32()?,
            prev_block_hash: self.read_hash()?,
            merkle_root: self.read_hash()?,
            timestamp: self.read_u32()?,
            bits: self.read_u32()?,
            nonce: self.read_u32()?,
        })
    }

    fn read_network_address(&mut self) -> Result<NetworkAddress> {
        Ok(NetworkAddress {
            services: self.read_u64()?,
            ip: self.read_array()?,
            port: self.read_u16_be()?,
        })
    }

    /// Read a count prefix and refuse anything above `limit`
    fn read_count(&mut self, limit: usize, what: &str) -> Result<usize> {
        let count = self.read_varint()?;
        if count > limit as u64 {
            return Err(NodeError::Malformed(format!(
                "{} {} entries exceeds limit of {}",
                count, what, limit
            )));
        }
        Ok(count as usize)
    }
}

// ============================================================================
// PAYLOAD ENCODING
// ============================================================================

fn put_network_address(out: &mut Vec<u8>, addr: &NetworkAddress) {
    out.extend_from_slice(&addr.services.to_le_bytes());
    out.extend_from_slice(&addr.ip);
    out.extend_from_slice(&addr.port.to_be_bytes());
}

fn put_inventory(out: &mut Vec<u8>, items: &[InventoryVector]) {
    out.extend(encode_varint(items.len() as u64));
    for item in items {
        out.extend_from_slice(&item.inv_type.to_le_bytes());
        out.extend_from_slice(&item.hash);
    }
}

fn put_locator(out: &mut Vec<u8>, locator: &LocatorMessage) {
    out.extend_from_slice(&locator.version.to_le_bytes());
    out.extend(encode_varint(locator.locator_hashes.len() as u64));
    for hash in &locator.locator_hashes {
        out.extend_from_slice(hash);
    }
    out.extend_from_slice(&locator.hash_stop);
}

/// Serialize a message payload (without the frame header)
pub fn encode_payload(message: &NetworkMessage) -> Vec<u8> {
    let mut out = Vec::new();
    match message {
        NetworkMessage::Version(v) => {
            out.extend_from_slice(&v.version.to_le_bytes());
            out.extend_from_slice(&v.services.to_le_bytes());
            out.extend_from_slice(&v.timestamp.to_le_bytes());
            put_network_address(&mut out, &v.addr_recv);
            put_network_address(&mut out, &v.addr_from);
            out.extend_from_slice(&v.nonce.to_le_bytes());
            out.extend(encode_var_string(&v.user_agent));
            out.extend_from_slice(&v.start_height.to_le_bytes());
            out.push(v.relay as u8);
        }
        NetworkMessage::VerAck | NetworkMessage::GetAddr | NetworkMessage::SendHeaders => {}
        NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => {
            out.extend_from_slice(&nonce.to_le_bytes());
        }
        NetworkMessage::Addr(entries) => {
            out.extend(encode_varint(entries.len() as u64));
            for entry in entries {
                out.extend_from_slice(&entry.timestamp.to_le_bytes());
                put_network_address(&mut out, &entry.address);
            }
        }
        NetworkMessage::Inv(items) | NetworkMessage::GetData(items) => put_inventory(&mut out, items),
        NetworkMessage::GetHeaders(locator) | NetworkMessage::GetBlocks(locator) => {
            put_locator(&mut out, locator)
        }
        NetworkMessage::Headers(headers) => {
            out.extend(encode_varint(headers.len() as u64));
            for header in headers {
                out.extend_from_slice(&encode_header(header));
                out.push(0); // tx count, always zero in a headers message
            }
        }
        NetworkMessage::Block(block) => out.extend_from_slice(&block.raw),
    }
    out
}

/// Build a complete frame for `message`
pub fn encode_message(magic: [u8; 4], message: &NetworkMessage) -> Vec<u8> {
    let payload = encode_payload(message);
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&message.command().to_wire());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend(payload);
    frame
}

// ============================================================================
// PAYLOAD DECODING
// ============================================================================

fn read_inventory(reader: &mut WireReader<'_>) -> Result<Vec<InventoryVector>> {
    let count = reader.read_count(MAX_INV_ENTRIES, "inventory")?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(InventoryVector {
            inv_type: reader.read_u32()?,
            hash: reader.read_hash()?,
        });
    }
    Ok(items)
}

fn read_locator(reader: &mut WireReader<'_>) -> Result<LocatorMessage> {
    let version = reader.read_u32()?;
    let count = reader.read_count(MAX_HEADERS_ENTRIES, "locator")?;
    let mut locator_hashes = Vec::with_capacity(count);
    for _ in 0..count {
        locator_hashes.push(reader.read_hash()?);
    }
    Ok(LocatorMessage {
        version,
        locator_hashes,
        hash_stop: reader.read_hash()?,
    })
}

/// Decode a payload for a known command.
///
/// `protocol_version` is the version negotiated with the sending peer; it
/// decides whether addr entries carry a timestamp.
pub fn decode_payload(command: Command, payload: &[u8], protocol_version: i32) -> Result<NetworkMessage> {
    let mut reader = WireReader::new(payload);
    let message = match command {
        Command::Version => {
            let version = reader.read_i32()?;
            let services = reader.read_u64()?;
            let timestamp = reader.read_i64()?;
            let addr_recv = reader.read_network_address()?;
            let addr_from = reader.read_network_address()?;
            let nonce = reader.read_u64()?;
            let user_agent = reader.read_var_string()?;
            let start_height = reader.read_i32()?;
            // relay is absent in older version messages
            let relay = if reader.is_empty() { true } else { reader.read_u8()? != 0 };
            NetworkMessage::Version(VersionMessage {
                version,
                services,
                timestamp,
                addr_recv,
                addr_from,
                nonce,
                user_agent,
                start_height,
                relay,
            })
        }
        Command::VerAck => NetworkMessage::VerAck,
        Command::GetAddr => NetworkMessage::GetAddr,
        Command::SendHeaders => NetworkMessage::SendHeaders,
        Command::Ping => NetworkMessage::Ping(reader.read_u64()?),
        Command::Pong => NetworkMessage::Pong(reader.read_u64()?),
        Command::Addr => {
            if protocol_version < MIN_ADDR_TIMESTAMP_VERSION {
                return Err(NodeError::UnsupportedProtocol {
                    version: protocol_version,
                    command: command.to_string(),
                });
            }
            let count = reader.read_count(MAX_ADDR_ENTRIES, "addr")?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(TimestampedAddress {
                    timestamp: reader.read_u32()?,
                    address: reader.read_network_address()?,
                });
            }
            NetworkMessage::Addr(entries)
        }
        Command::Inv => NetworkMessage::Inv(read_inventory(&mut reader)?),
        Command::GetData => NetworkMessage::GetData(read_inventory(&mut reader)?),
        Command::GetHeaders => NetworkMessage::GetHeaders(read_locator(&mut reader)?),
        Command::GetBlocks => NetworkMessage::GetBlocks(read_locator(&mut reader)?),
        Command::Headers => {
            let count = reader.read_count(MAX_HEADERS_ENTRIES, "headers")?;
            let mut headers = Vec::with_capacity(count);
            for _ in 0..count {
                headers.push(reader.read_header()?);
                reader.read_varint()?; // tx count
            }
            NetworkMessage::Headers(headers)
        }
        Command::Block => {
            let header = reader.read_bytes(HEADER_SIZE)?;
            NetworkMessage::Block(BlockMessage {
                hash: double_sha256(header),
                raw: payload.to_vec(),
            })
        }
    };
    Ok(message)
}

// ============================================================================
// STREAM REASSEMBLY
// ============================================================================

/// Whether `buffer` starts with `magic`; a shorter buffer matches on its prefix
fn begins_with_magic(buffer: &[u8], magic: &[u8; 4]) -> bool {
    let n = buffer.len().min(magic.len());
    buffer[..n] == magic[..n]
}

/// Per-connection frame reassembler
pub struct FrameDecoder {
    magic: [u8; 4],
    buffer: Vec<u8>,
    protocol_version: i32,
}

impl FrameDecoder {
    pub fn new(magic: [u8; 4]) -> Self {
        FrameDecoder {
            magic,
            buffer: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Protocol version used for version-dependent payloads
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: i32) {
        self.protocol_version = version;
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one delivery of bytes and return every message it completes.
    ///
    /// If the accumulated bytes no longer begin with the magic, everything
    /// buffered before this delivery is discarded and the delivery itself
    /// becomes the new anchor.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<NetworkMessage>> {
        self.buffer.extend_from_slice(bytes);
        if !begins_with_magic(&self.buffer, &self.magic) {
            debug!(
                dropped = self.buffer.len() - bytes.len(),
                "stream desynchronized, resyncing on latest delivery"
            );
            self.buffer = bytes.to_vec();
        }

        let mut messages = Vec::new();
        while begins_with_magic(&self.buffer, &self.magic) && self.buffer.len() >= FRAME_HEADER_SIZE {
            let mut field = [0u8; COMMAND_SIZE];
            field.copy_from_slice(&self.buffer[4..16]);
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&self.buffer[16..20]);
            let length = u32::from_le_bytes(len_bytes) as usize;
            if length > MAX_FRAME_PAYLOAD {
                return Err(NodeError::PayloadTooLarge(length));
            }
            let frame_len = FRAME_HEADER_SIZE + length;
            if self.buffer.len() < frame_len {
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
            let payload = &frame[FRAME_HEADER_SIZE..];
            let command = Command::from_wire(&field);
            if frame[20..24] != checksum(payload) {
                let name = String::from_utf8_lossy(&field).trim_end_matches('\0').to_string();
                return Err(NodeError::ChecksumMismatch { command: name });
            }

            match command {
                Some(command) => {
                    let message = decode_payload(command, payload, self.protocol_version)?;
                    if let NetworkMessage::Version(v) = &message {
                        self.protocol_version = v.version.min(PROTOCOL_VERSION);
                    }
                    messages.push(message);
                }
                None => trace!(
                    command = %String::from_utf8_lossy(&field).trim_end_matches('\0'),
                    length,
                    "skipping unknown command"
                ),
            }
        }

        if !self.buffer.is_empty() && !begins_with_magic(&self.buffer, &self.magic) {
            debug!(bytes = self.buffer.len(), "trailing bytes do not start a frame");
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: &NetworkMessage) -> Vec<u8> {
        encode_message(MAINNET_MAGIC, message)
    }

    #[test]
    fn test_varint_boundaries() {
        assert_eq!(encode_varint(0xfc), vec![0xfc]);
        assert_eq!(encode_varint(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(encode_varint(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(encode_varint(0x1_0000_0000).len(), 9);
    }

    #[test]
    fn test_decode_varint_truncated() {
        assert!(matches!(decode_varint(&[0xfe, 0x01]), Err(NodeError::Truncated(_))));
        assert!(matches!(decode_varint(&[]), Err(NodeError::Truncated(_))));
    }

    #[test]
    fn test_var_string() {
        let encoded = encode_var_string("/lightnode:0.1.0/");
        let (s, used) = decode_var_string(&encoded).unwrap();
        assert_eq!(s, "/lightnode:0.1.0/");
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_checksum_of_empty_payload() {
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_begins_with_magic_prefix() {
        assert!(begins_with_magic(&[], &MAINNET_MAGIC));
        assert!(begins_with_magic(&[0xf9, 0xbe], &MAINNET_MAGIC));
        assert!(!begins_with_magic(&[0xf9, 0x00], &MAINNET_MAGIC));
    }

    #[test]
    fn test_verack_frame_layout() {
        let bytes = frame(&NetworkMessage::VerAck);
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(&bytes[..4], &MAINNET_MAGIC);
        assert_eq!(&bytes[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_unknown_command_skipped() {
        let mut bytes = frame(&NetworkMessage::VerAck);
        bytes[4..16].copy_from_slice(b"feefilter\0\0\0");
        bytes.extend(frame(&NetworkMessage::Ping(9)));
        let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
        let messages = decoder.feed(&bytes).unwrap();
        assert_eq!(messages, vec![NetworkMessage::Ping(9)]);
    }

    #[test]
    fn test_version_sets_protocol_version() {
        let peer = PeerAddress::new("127.0.0.1".parse().unwrap(), 8333);
        let mut version = VersionMessage::outbound(&peer, 0, 1, 0);
        version.version = 31000;
        let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
        decoder.feed(&frame(&NetworkMessage::Version(version))).unwrap();
        assert_eq!(decoder.protocol_version(), 31000);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = frame(&NetworkMessage::VerAck);
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
        assert!(matches!(decoder.feed(&bytes), Err(NodeError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_block_payload_hashes_header() {
        let genesis = BlockHeader::genesis().unwrap();
        let mut raw = genesis.to_bytes().to_vec();
        raw.push(0);
        let message = decode_payload(Command::Block, &raw, PROTOCOL_VERSION).unwrap();
        match message {
            NetworkMessage::Block(block) => {
                assert_eq!(block.hash, genesis.hash());
                assert_eq!(block.raw, raw);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_block_payload_truncated() {
        assert!(matches!(
            decode_payload(Command::Block, &[0u8; 10], PROTOCOL_VERSION),
            Err(NodeError::Truncated(_))
        ));
    }
}
