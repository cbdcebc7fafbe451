//! UTXO replay tests: set semantics and the builder loop

use async_trait::async_trait;
use lightnode::codec::{double_sha256, encode_header, encode_varint};
use lightnode::message::BlockMessage;
use lightnode::utxo::{OutputSlot, UtxoSnapshot};
use lightnode::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Legacy transaction bytes: inputs are (txid, index), outputs are values
fn tx_bytes(inputs: &[(Hash, u32)], outputs: &[u64], lock_time: u32) -> Vec<u8> {
    let mut out = 1i32.to_le_bytes().to_vec();
    out.extend(encode_varint(inputs.len() as u64));
    for (txid, index) in inputs {
        out.extend_from_slice(txid);
        out.extend_from_slice(&index.to_le_bytes());
        out.extend(encode_varint(0));
        out.extend_from_slice(&u32::MAX.to_le_bytes());
    }
    out.extend(encode_varint(outputs.len() as u64));
    for value in outputs {
        out.extend_from_slice(&value.to_le_bytes());
        out.extend(encode_varint(2));
        out.extend_from_slice(&[0x00, 0x14]);
    }
    out.extend_from_slice(&lock_time.to_le_bytes());
    out
}

fn coinbase(tag: u32, outputs: &[u64]) -> Vec<u8> {
    // the lock time doubles as a tag so every coinbase gets its own txid
    tx_bytes(&[([0; 32], u32::MAX)], outputs, tag)
}

fn block_bytes(header: &BlockHeader, txs: &[Vec<u8>]) -> Vec<u8> {
    let mut out = encode_header(header).to_vec();
    out.extend(encode_varint(txs.len() as u64));
    for tx in txs {
        out.extend_from_slice(tx);
    }
    out
}

fn child(prev: &BlockHeader, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block_hash: prev.hash(),
        merkle_root: [0; 32],
        timestamp: 1_300_000_000 + nonce,
        bits: 0x1d00ffff,
        nonce,
    }
}

#[test]
fn test_two_block_replay() {
    let decoder = WireBlockDecoder;
    let genesis = BlockHeader::genesis().unwrap();
    let header_a = child(&genesis, 1);
    let header_b = child(&header_a, 2);

    let coinbase_a = coinbase(1, &[30, 20]);
    let x = double_sha256(&coinbase_a);
    let spend = tx_bytes(&[(x, 0)], &[29], 0);
    let y = double_sha256(&spend);

    let block_a = decoder.decode_block(&block_bytes(&header_a, &[coinbase_a])).unwrap();
    let block_b = decoder
        .decode_block(&block_bytes(&header_b, &[coinbase(2, &[50]), spend]))
        .unwrap();

    let mut set = UtxoSet::new();
    set.apply_block(&block_a);
    set.apply_block(&block_b);

    let entry_x = set.get(&x).unwrap();
    assert_eq!(entry_x.slots.len(), 2);
    assert_eq!(entry_x.slots[0], OutputSlot::Spent);
    assert_eq!(set.output(&x, 1).unwrap().value, 20);
    let entry_y = set.get(&y).unwrap();
    assert_eq!(entry_y.slots.len(), 1);
    assert_eq!(set.output(&y, 0).unwrap().value, 29);
    // A's coinbase, B's coinbase and Y
    assert_eq!(set.len(), 3);

    let header_c = child(&header_b, 3);
    let finish = tx_bytes(&[(x, 1)], &[19], 0);
    let block_c = decoder
        .decode_block(&block_bytes(&header_c, &[coinbase(3, &[50]), finish]))
        .unwrap();
    set.apply_block(&block_c);
    assert!(set.get(&x).is_none());
}

#[test]
fn test_timelocked_transaction_keeps_lock() {
    let decoder = WireBlockDecoder;
    let genesis = BlockHeader::genesis().unwrap();
    let header = child(&genesis, 1);
    let locked = tx_bytes(&[([8; 32], 0)], &[5], 800_000);
    let txid = double_sha256(&locked);
    let block = decoder
        .decode_block(&block_bytes(&header, &[coinbase(1, &[50]), locked]))
        .unwrap();

    let mut set = UtxoSet::new();
    let stats = set.apply_block(&block);
    assert_eq!(stats.missing, 1);
    assert_eq!(set.get(&txid).unwrap().timelock, Some(800_000));
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Default)]
struct BlockServer {
    blocks: HashMap<Hash, Vec<u8>>,
    calls: Mutex<Vec<Vec<Hash>>>,
    failures: AtomicUsize,
}

impl BlockServer {
    fn calls(&self) -> Vec<Vec<Hash>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerNetwork for BlockServer {
    async fn request_headers(&self, _from: Hash) -> Result<()> {
        Ok(())
    }

    async fn download_blocks(&self, hashes: Vec<Hash>) -> Result<Vec<BlockMessage>> {
        self.calls.lock().unwrap().push(hashes.clone());
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(NodeError::DownloadTimeout {
                missing: hashes.len(),
                requested: hashes.len(),
            });
        }
        hashes
            .iter()
            .map(|hash| {
                self.blocks
                    .get(hash)
                    .map(|raw| BlockMessage { hash: *hash, raw: raw.clone() })
                    .ok_or(NodeError::DownloadTimeout { missing: 1, requested: 1 })
            })
            .collect()
    }
}

/// Store with genesis plus `count` headers, and a server holding a block
/// with one coinbase for every one of them
fn fixture(count: u32) -> (Arc<MemoryStore>, BlockServer, Vec<StoredHeader>) {
    let store = Arc::new(MemoryStore::new());
    let mut server = BlockServer::default();
    let mut header = BlockHeader::genesis().unwrap();
    for height in 0..=count {
        if height > 0 {
            header = child(&header, height);
        }
        let stored = StoredHeader::new(height as u64, header);
        server
            .blocks
            .insert(stored.hash, block_bytes(&header, &[coinbase(height, &[50])]));
        store.append_header(stored).unwrap();
    }
    let headers = store.headers_in_height_range(0, count as u64).unwrap();
    (store, server, headers)
}

fn builder(store: Arc<MemoryStore>, server: Arc<BlockServer>, step: u64, checkpoint: u64) -> UtxoBuilder {
    UtxoBuilder::new(store, server, Arc::new(WireBlockDecoder), step, checkpoint)
        .with_retry_backoff(Duration::from_millis(1))
}

#[tokio::test]
async fn test_builder_replays_whole_chain() {
    let (store, server, headers) = fixture(6);
    let server = Arc::new(server);
    let utxo = builder(store.clone(), server.clone(), 2, 3);

    let set = utxo.start(SyncState::Synced).await.unwrap().unwrap();
    assert_eq!(set.len(), 7);

    // batches of step + 1 heights: [0..=2], [3..=5], [6]
    let calls = server.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], headers[0..3].iter().map(|h| h.hash).collect::<Vec<_>>());
    assert_eq!(calls[2], vec![headers[6].hash]);

    let snapshot = store.read_utxo_snapshot("utxo").unwrap().unwrap();
    assert_eq!(snapshot.height, 7);
    assert_eq!(snapshot.utxo, set);
    assert_eq!(store.get_config("utxo.height").unwrap(), Some(serde_json::json!(7)));
}

#[tokio::test]
async fn test_builder_requires_synced_chain() {
    let (store, server, _) = fixture(2);
    let utxo = builder(store, Arc::new(server), 4, 1000);
    assert!(utxo.start(SyncState::Unsynced).await.unwrap().is_none());
    assert!(!utxo.is_started());
}

#[tokio::test]
async fn test_builder_runs_once() {
    let (store, server, _) = fixture(2);
    let utxo = builder(store, Arc::new(server), 4, 1000);
    assert!(utxo.start(SyncState::Synced).await.unwrap().is_some());
    assert!(utxo.start(SyncState::Synced).await.unwrap().is_none());
}

#[tokio::test]
async fn test_builder_retries_failed_download() {
    let (store, server, _) = fixture(3);
    server.failures.store(2, Ordering::SeqCst);
    let server = Arc::new(server);
    let utxo = builder(store, server.clone(), 4, 1000);

    let set = utxo.start(SyncState::Synced).await.unwrap().unwrap();
    assert_eq!(set.len(), 4);
    let calls = server.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], calls[2]);
}

#[tokio::test]
async fn test_builder_resumes_from_snapshot() {
    let (store, server, headers) = fixture(5);
    store
        .write_utxo_snapshot(
            "utxo",
            &UtxoSnapshot {
                height: 4,
                step: 0,
                utxo: UtxoSet::new(),
            },
        )
        .unwrap();
    let server = Arc::new(server);
    let utxo = builder(store, server.clone(), 4, 1000);

    let set = utxo.start(SyncState::Synced).await.unwrap().unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(
        server.calls(),
        vec![vec![headers[4].hash], vec![headers[5].hash]]
    );
}

#[tokio::test]
async fn test_step_from_store_config() {
    let (store, server, _) = fixture(3);
    store.set_config("utxo.step", serde_json::json!(0)).unwrap();
    let server = Arc::new(server);
    let utxo = builder(store, server.clone(), 4, 1000);
    utxo.start(SyncState::Synced).await.unwrap();
    assert_eq!(server.calls().len(), 4);
}
