//! Wire codec tests: varints, headers, framing and stream reassembly

use lightnode::codec::*;
use lightnode::constants::*;
use lightnode::message::*;
use lightnode::*;

fn genesis_bytes() -> Vec<u8> {
    hex::decode(GENESIS_HEADER_HEX).unwrap()
}

fn frame(message: &NetworkMessage) -> Vec<u8> {
    encode_message(MAINNET_MAGIC, message)
}

#[test]
fn test_varint_round_trip() {
    let cases: [(u64, usize); 8] = [
        (0, 1),
        (1, 1),
        (0xfc, 1),
        (0xfd, 3),
        (0xffff, 3),
        (0x1_0000, 5),
        (0xffff_ffff, 5),
        (0x1_0000_0000, 9),
    ];
    for (value, width) in cases {
        let encoded = encode_varint(value);
        assert_eq!(encoded.len(), width, "width of {:#x}", value);
        assert_eq!(decode_varint(&encoded).unwrap(), (value, width));
    }
}

#[test]
fn test_varint_ignores_trailing_bytes() {
    let mut encoded = encode_varint(0xfd);
    encoded.extend_from_slice(&[0xaa, 0xbb]);
    assert_eq!(decode_varint(&encoded).unwrap(), (0xfd, 3));
}

#[test]
fn test_header_round_trip() {
    let raw = genesis_bytes();
    let header = decode_header(&raw).unwrap();
    assert_eq!(encode_header(&header).to_vec(), raw);
    assert_eq!(header.version, 1);
    assert_eq!(header.timestamp, 1_231_006_505);
    assert_eq!(header.bits, 0x1d00ffff);
}

#[test]
fn test_genesis_hash_fixture() {
    let header = decode_header(&genesis_bytes()).unwrap();
    assert_eq!(to_display_hex(&header.hash()), GENESIS_HASH_HEX);
    assert_eq!(header.hash(), header.hash());
}

#[test]
fn test_frame_split_across_deliveries() {
    let bytes = frame(&NetworkMessage::Ping(0xdead_beef));
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);

    let first = decoder.feed(&bytes[..10]).unwrap();
    assert!(first.is_empty());
    assert_eq!(decoder.buffered(), 10);

    let second = decoder.feed(&bytes[10..]).unwrap();
    assert_eq!(second, vec![NetworkMessage::Ping(0xdead_beef)]);
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn test_frame_split_inside_magic() {
    let bytes = frame(&NetworkMessage::VerAck);
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    assert!(decoder.feed(&bytes[..2]).unwrap().is_empty());
    assert_eq!(decoder.feed(&bytes[2..]).unwrap(), vec![NetworkMessage::VerAck]);
}

#[test]
fn test_coalesced_frames_and_partial_tail() {
    let mut bytes = frame(&NetworkMessage::VerAck);
    bytes.extend(frame(&NetworkMessage::Ping(1)));
    let third = frame(&NetworkMessage::Pong(2));
    bytes.extend_from_slice(&third[..30]);

    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    let messages = decoder.feed(&bytes).unwrap();
    assert_eq!(messages, vec![NetworkMessage::VerAck, NetworkMessage::Ping(1)]);
    assert_eq!(decoder.feed(&third[30..]).unwrap(), vec![NetworkMessage::Pong(2)]);
}

#[test]
fn test_checksum_mismatch_rejected() {
    let mut bytes = frame(&NetworkMessage::Ping(5));
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    match decoder.feed(&bytes) {
        Err(NodeError::ChecksumMismatch { command }) => assert_eq!(command, "ping"),
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
}

#[test]
fn test_desync_discards_buffer_and_resyncs() {
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    // garbage that does not begin with the magic
    assert!(decoder.feed(&[0x00, 0x11, 0x22]).unwrap().is_empty());
    // the next delivery is a clean frame: the garbage is dropped, the frame decodes
    let bytes = frame(&NetworkMessage::Ping(3));
    assert_eq!(decoder.feed(&bytes).unwrap(), vec![NetworkMessage::Ping(3)]);
}

#[test]
fn test_wrong_magic_is_never_decoded() {
    let bytes = encode_message([0x0b, 0x11, 0x09, 0x07], &NetworkMessage::VerAck);
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    assert!(decoder.feed(&bytes).unwrap().is_empty());
}

#[test]
fn test_version_round_trip() {
    let peer = PeerAddress::new("73.142.142.138".parse().unwrap(), 8333);
    let version = VersionMessage::outbound(&peer, 1_700_000_000, 99, 812_000);
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    let decoded = decoder.feed(&frame(&NetworkMessage::Version(version.clone()))).unwrap();
    assert_eq!(decoded, vec![NetworkMessage::Version(version)]);
}

#[test]
fn test_version_without_relay_defaults_true() {
    let peer = PeerAddress::new("10.0.0.1".parse().unwrap(), 8333);
    let mut version = VersionMessage::outbound(&peer, 0, 1, 0);
    version.relay = false;
    let mut payload = encode_payload(&NetworkMessage::Version(version));
    payload.pop();
    match decode_payload(Command::Version, &payload, PROTOCOL_VERSION).unwrap() {
        NetworkMessage::Version(v) => assert!(v.relay),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_headers_payload_skips_tx_count() {
    let header = decode_header(&genesis_bytes()).unwrap();
    let mut payload = encode_varint(2);
    for _ in 0..2 {
        payload.extend_from_slice(&encode_header(&header));
        payload.push(0x00);
    }
    match decode_payload(Command::Headers, &payload, PROTOCOL_VERSION).unwrap() {
        NetworkMessage::Headers(headers) => assert_eq!(headers, vec![header, header]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_headers_count_limit() {
    let payload = encode_varint(MAX_HEADERS_ENTRIES as u64 + 1);
    assert!(matches!(
        decode_payload(Command::Headers, &payload, PROTOCOL_VERSION),
        Err(NodeError::Malformed(_))
    ));
}

#[test]
fn test_addr_payload() {
    let mut payload = encode_varint(1);
    payload.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    payload.extend_from_slice(&1u64.to_le_bytes());
    payload.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 73, 142, 142, 138]);
    payload.extend_from_slice(&8333u16.to_be_bytes());

    match decode_payload(Command::Addr, &payload, PROTOCOL_VERSION).unwrap() {
        NetworkMessage::Addr(entries) => {
            assert_eq!(entries.len(), 1);
            let address = PeerAddress::from(&entries[0].address);
            assert_eq!(address.to_string(), "73.142.142.138:8333");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_addr_from_old_protocol_unsupported() {
    let payload = encode_varint(0);
    assert!(matches!(
        decode_payload(Command::Addr, &payload, 31401),
        Err(NodeError::UnsupportedProtocol { version: 31401, .. })
    ));
}

#[test]
fn test_getheaders_layout() {
    let payload = encode_payload(&NetworkMessage::get_headers([7; 32]));
    assert_eq!(payload.len(), 4 + 1 + 32 + 32);
    assert_eq!(&payload[..4], &(PROTOCOL_VERSION as u32).to_le_bytes());
    assert_eq!(payload[4], 1);
    assert_eq!(&payload[5..37], &[7; 32]);
    assert_eq!(&payload[37..], &[0; 32]);
}

#[test]
fn test_inv_round_trip() {
    let items = vec![InventoryVector {
        inv_type: INV_TYPE_BLOCK,
        hash: [3; 32],
    }];
    let mut decoder = FrameDecoder::new(MAINNET_MAGIC);
    let decoded = decoder.feed(&frame(&NetworkMessage::Inv(items.clone()))).unwrap();
    assert_eq!(decoded, vec![NetworkMessage::Inv(items)]);
}
