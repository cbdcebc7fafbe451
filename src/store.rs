//! Persistence for headers, node state and UTXO checkpoints

use crate::error::{NodeError, Result};
use crate::types::StoredHeader;
use crate::utxo::UtxoSnapshot;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBRecoveryMode, Direction, IteratorMode, Options, WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Storage used by chain sync and the UTXO builder.
///
/// Headers form an append-only sequence indexed by height; `append_header`
/// refuses anything but the next height.
pub trait Store: Send + Sync {
    fn count_headers(&self) -> Result<u64>;
    fn latest_header(&self) -> Result<Option<StoredHeader>>;
    fn append_header(&self, header: StoredHeader) -> Result<()>;
    /// Headers with `low <= height <= high`, ascending
    fn headers_in_height_range(&self, low: u64, high: u64) -> Result<Vec<StoredHeader>>;
    fn get_config(&self, key: &str) -> Result<Option<Value>>;
    fn set_config(&self, key: &str, value: Value) -> Result<()>;
    fn read_utxo_snapshot(&self, id: &str) -> Result<Option<UtxoSnapshot>>;
    fn write_utxo_snapshot(&self, id: &str, snapshot: &UtxoSnapshot) -> Result<()>;
}

fn check_next_height(expected: u64, header: &StoredHeader) -> Result<()> {
    if header.height != expected {
        return Err(NodeError::Storage(format!(
            "header at height {} appended, expected height {}",
            header.height, expected
        )));
    }
    Ok(())
}

fn slice_range(headers: &[StoredHeader], low: u64, high: u64) -> Vec<StoredHeader> {
    if low > high || low >= headers.len() as u64 {
        return Vec::new();
    }
    let end = (high as usize).saturating_add(1).min(headers.len());
    headers[low as usize..end].to_vec()
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| NodeError::Storage("store lock poisoned".to_string()))
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Default)]
struct Tables {
    headers: Vec<StoredHeader>,
    config: HashMap<String, Value>,
    snapshots: HashMap<String, UtxoSnapshot>,
}

/// Volatile store, used in tests and for throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn count_headers(&self) -> Result<u64> {
        Ok(lock(&self.tables)?.headers.len() as u64)
    }

    fn latest_header(&self) -> Result<Option<StoredHeader>> {
        Ok(lock(&self.tables)?.headers.last().cloned())
    }

    fn append_header(&self, header: StoredHeader) -> Result<()> {
        let mut tables = lock(&self.tables)?;
        check_next_height(tables.headers.len() as u64, &header)?;
        tables.headers.push(header);
        Ok(())
    }

    fn headers_in_height_range(&self, low: u64, high: u64) -> Result<Vec<StoredHeader>> {
        Ok(slice_range(&lock(&self.tables)?.headers, low, high))
    }

    fn get_config(&self, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.tables)?.config.get(key).cloned())
    }

    fn set_config(&self, key: &str, value: Value) -> Result<()> {
        lock(&self.tables)?.config.insert(key.to_string(), value);
        Ok(())
    }

    fn read_utxo_snapshot(&self, id: &str) -> Result<Option<UtxoSnapshot>> {
        Ok(lock(&self.tables)?.snapshots.get(id).cloned())
    }

    fn write_utxo_snapshot(&self, id: &str, snapshot: &UtxoSnapshot) -> Result<()> {
        lock(&self.tables)?
            .snapshots
            .insert(id.to_string(), snapshot.clone());
        Ok(())
    }
}

// ============================================================================
// ON-DISK STORE
// ============================================================================

const CF_HEADERS: &str = "headers";
const CF_CONFIG: &str = "config";
const CF_SNAPSHOTS: &str = "snapshots";

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

/// RocksDB-backed store.
///
/// Headers live in the `headers` column family keyed by big-endian height, so
/// key order is height order. Config values and UTXO snapshots are JSON blobs
/// in their own column families.
pub struct FileStore {
    db: DB,
    // next height to append; appends are serialized through this lock
    count: Mutex<u64>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_wal_recovery_mode(DBRecoveryMode::TolerateCorruptedTailRecords);

        let descriptors: Vec<ColumnFamilyDescriptor> = [CF_HEADERS, CF_CONFIG, CF_SNAPSHOTS]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DB::open_cf_descriptors(&db_opts, dir, descriptors)?;

        let count = {
            let headers = column(&db, CF_HEADERS)?;
            match db.iterator_cf(headers, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_height(&key)? + 1
                }
                None => 0,
            }
        };

        info!(path = %dir.display(), headers = count, "opened store");
        Ok(FileStore {
            db,
            count: Mutex::new(count),
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(column(&self.db, cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T, sync: bool) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        self.db
            .put_cf_opt(column(&self.db, cf)?, key, bytes, &write_opts)?;
        Ok(())
    }
}

fn column<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| NodeError::Storage(format!("column family {} missing", name)))
}

fn decode_height(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| NodeError::Storage(format!("bad header key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl Store for FileStore {
    fn count_headers(&self) -> Result<u64> {
        Ok(*lock(&self.count)?)
    }

    fn latest_header(&self) -> Result<Option<StoredHeader>> {
        let count = *lock(&self.count)?;
        match count.checked_sub(1) {
            Some(height) => self.get_json(CF_HEADERS, &height_key(height)),
            None => Ok(None),
        }
    }

    fn append_header(&self, header: StoredHeader) -> Result<()> {
        let mut count = lock(&self.count)?;
        check_next_height(*count, &header)?;
        self.put_json(CF_HEADERS, &height_key(header.height), &header, false)?;
        *count += 1;
        Ok(())
    }

    fn headers_in_height_range(&self, low: u64, high: u64) -> Result<Vec<StoredHeader>> {
        if low > high {
            return Ok(Vec::new());
        }
        let start = height_key(low);
        let iter = self.db.iterator_cf(
            column(&self.db, CF_HEADERS)?,
            IteratorMode::From(&start, Direction::Forward),
        );
        let mut headers = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if decode_height(&key)? > high {
                break;
            }
            headers.push(serde_json::from_slice(&value)?);
        }
        Ok(headers)
    }

    fn get_config(&self, key: &str) -> Result<Option<Value>> {
        self.get_json(CF_CONFIG, key.as_bytes())
    }

    fn set_config(&self, key: &str, value: Value) -> Result<()> {
        self.put_json(CF_CONFIG, key.as_bytes(), &value, true)
    }

    fn read_utxo_snapshot(&self, id: &str) -> Result<Option<UtxoSnapshot>> {
        let snapshot: Option<UtxoSnapshot> = self.get_json(CF_SNAPSHOTS, id.as_bytes())?;
        if let Some(snapshot) = &snapshot {
            debug!(id, height = snapshot.height, "loaded utxo snapshot");
        }
        Ok(snapshot)
    }

    fn write_utxo_snapshot(&self, id: &str, snapshot: &UtxoSnapshot) -> Result<()> {
        self.put_json(CF_SNAPSHOTS, id.as_bytes(), snapshot, true)?;
        debug!(id, height = snapshot.height, "wrote utxo snapshot");
        Ok(())
    }
}
