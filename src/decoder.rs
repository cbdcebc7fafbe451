//! Full-block decoding for UTXO replay
//!
//! The peer pool hands blocks around as raw bytes; only the UTXO builder needs
//! transactions, and it gets them through a [`BlockDecoder`].

use crate::codec::{double_sha256, WireReader};
use crate::error::{NodeError, Result};
use crate::types::*;

/// Turns raw block bytes into a header plus parsed transactions
pub trait BlockDecoder: Send + Sync {
    fn decode_block(&self, raw: &[u8]) -> Result<Block>;
}

/// Decoder for the Bitcoin block serialization, legacy and segwit transactions
#[derive(Debug, Default, Clone, Copy)]
pub struct WireBlockDecoder;

impl BlockDecoder for WireBlockDecoder {
    fn decode_block(&self, raw: &[u8]) -> Result<Block> {
        let mut reader = WireReader::new(raw);
        let header = reader.read_header().map_err(as_decode)?;
        let count = reader.read_varint().map_err(as_decode)?;
        // every transaction takes at least 60 bytes, so a larger count is garbage
        if count > reader.remaining() as u64 {
            return Err(NodeError::Decode(format!("implausible transaction count {}", count)));
        }
        let mut transactions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transactions.push(read_transaction(raw, &mut reader).map_err(as_decode)?);
        }
        if !reader.is_empty() {
            return Err(NodeError::Decode(format!(
                "{} trailing bytes after transactions",
                reader.remaining()
            )));
        }
        Ok(Block { header, transactions })
    }
}

fn as_decode(err: NodeError) -> NodeError {
    match err {
        NodeError::Decode(_) => err,
        other => NodeError::Decode(other.to_string()),
    }
}

fn skip_script(reader: &mut WireReader<'_>) -> Result<Vec<u8>> {
    let len = reader.read_varint()? as usize;
    Ok(reader.read_bytes(len)?.to_vec())
}

/// Parse one transaction starting at the reader's position.
///
/// The txid hashes the legacy serialization, so for segwit transactions the
/// marker, flag and witness bytes are cut out before hashing.
fn read_transaction(raw: &[u8], reader: &mut WireReader<'_>) -> Result<Transaction> {
    let start = reader.position();
    reader.read_i32()?; // version

    let mut segwit = false;
    let rest = &raw[reader.position()..];
    if rest.len() >= 2 && rest[0] == 0x00 && rest[1] == 0x01 {
        segwit = true;
        reader.read_bytes(2)?;
    }
    let body_start = reader.position();

    let input_count = reader.read_varint()?;
    let mut inputs = Vec::new();
    for _ in 0..input_count {
        let prev_txid = reader.read_hash()?;
        let prev_index = reader.read_u32()?;
        skip_script(reader)?; // script_sig
        reader.read_u32()?; // sequence
        inputs.push(TxInput { prev_txid, prev_index });
    }

    let output_count = reader.read_varint()?;
    let mut outputs = Vec::new();
    for _ in 0..output_count {
        let value = reader.read_u64()?;
        let script_pubkey = skip_script(reader)?;
        outputs.push(TxOutput { value, script_pubkey });
    }
    let body_end = reader.position();

    if segwit {
        for _ in 0..input_count {
            let items = reader.read_varint()?;
            for _ in 0..items {
                skip_script(reader)?;
            }
        }
    }
    let lock_start = reader.position();
    let lock_time = reader.read_u32()?;

    let mut legacy = Vec::with_capacity(reader.position() - start);
    legacy.extend_from_slice(&raw[start..start + 4]);
    legacy.extend_from_slice(&raw[body_start..body_end]);
    legacy.extend_from_slice(&raw[lock_start..lock_start + 4]);

    Ok(Transaction {
        txid: double_sha256(&legacy),
        inputs,
        outputs,
        timelock: if lock_time == 0 { None } else { Some(lock_time) },
    })
}
