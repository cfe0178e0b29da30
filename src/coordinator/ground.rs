//! Ground store: the replicated mirror of sequoia-tracked replicas
//!
//! Two logical tables:
//! - `chunk_replicas`: one row per chunk with its sequoia replicas
//! - `location_replicas`: one row per (location, chunk) pair
//!
//! Rows are only ever written by the projection worker in
//! [`crate::coordinator::mirror`]; everything else reads.

use crate::common::{ChunkId, GroundBackend, GroundConfig, LocationId, Result, StoredReplica};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const CF_CHUNK_REPLICAS: &str = "chunk_replicas";
pub const CF_LOCATION_REPLICAS: &str = "location_replicas";

/// Row of the `chunk_replicas` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReplicasRow {
    pub chunk_id: ChunkId,
    pub replicas: Vec<StoredReplica>,
    pub last_seen_replicas: Vec<StoredReplica>,
}

/// Row of the `location_replicas` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationReplicaRow {
    pub location_uuid: LocationId,
    pub chunk_id: ChunkId,
    pub medium: String,
}

/// A single row mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroundWrite {
    PutChunk(ChunkReplicasRow),
    DeleteChunk(ChunkId),
    PutLocation(LocationReplicaRow),
    DeleteLocation { location: LocationId, chunk: ChunkId },
}

impl GroundWrite {
    pub fn is_delete(&self) -> bool {
        matches!(self, GroundWrite::DeleteChunk(_) | GroundWrite::DeleteLocation { .. })
    }
}

/// Storage backend for the ground tables.
///
/// `apply` must be atomic: either every write of the batch lands or none does.
pub trait GroundStore: Send + Sync {
    fn apply(&self, batch: &[GroundWrite]) -> Result<()>;

    fn get_chunk_replicas(&self, chunk: &ChunkId) -> Result<Option<ChunkReplicasRow>>;

    /// All `location_replicas` rows of one location
    fn location_replicas(&self, location: &LocationId) -> Result<Vec<LocationReplicaRow>>;

    fn scan_chunk_replicas(&self) -> Result<Vec<ChunkReplicasRow>>;

    fn scan_location_replicas(&self) -> Result<Vec<LocationReplicaRow>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the backend selected by the configuration
pub fn open_ground(config: &GroundConfig) -> Result<Arc<dyn GroundStore>> {
    match config.backend {
        GroundBackend::Rocksdb => Ok(Arc::new(RocksGroundStore::open(&config.path)?)),
        GroundBackend::Memory => Ok(Arc::new(MemGroundStore::new())),
    }
}

fn location_key(location: &LocationId, chunk: &ChunkId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(location.as_bytes());
    key[16..].copy_from_slice(chunk.as_bytes());
    key
}

/// RocksDB-backed ground store
pub struct RocksGroundStore {
    db: DB,
}

impl RocksGroundStore {
    /// Open or create the ground store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_CHUNK_REPLICAS, CF_LOCATION_REPLICAS])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| crate::Error::Internal(format!("missing column family {}", name)))
    }

    fn decode_chunk_row(bytes: &[u8]) -> Result<ChunkReplicasRow> {
        bincode::deserialize(bytes).map_err(|e| crate::Error::GroundCorrupted(e.to_string()))
    }

    fn decode_location_row(bytes: &[u8]) -> Result<LocationReplicaRow> {
        bincode::deserialize(bytes).map_err(|e| crate::Error::GroundCorrupted(e.to_string()))
    }
}

impl GroundStore for RocksGroundStore {
    fn apply(&self, batch: &[GroundWrite]) -> Result<()> {
        let chunks = self.cf(CF_CHUNK_REPLICAS)?;
        let locations = self.cf(CF_LOCATION_REPLICAS)?;

        let mut wb = WriteBatch::default();
        for write in batch {
            match write {
                GroundWrite::PutChunk(row) => {
                    wb.put_cf(chunks, row.chunk_id.as_bytes(), bincode::serialize(row)?);
                }
                GroundWrite::DeleteChunk(chunk) => {
                    wb.delete_cf(chunks, chunk.as_bytes());
                }
                GroundWrite::PutLocation(row) => {
                    let key = location_key(&row.location_uuid, &row.chunk_id);
                    wb.put_cf(locations, key, bincode::serialize(row)?);
                }
                GroundWrite::DeleteLocation { location, chunk } => {
                    wb.delete_cf(locations, location_key(location, chunk));
                }
            }
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn get_chunk_replicas(&self, chunk: &ChunkId) -> Result<Option<ChunkReplicasRow>> {
        let cf = self.cf(CF_CHUNK_REPLICAS)?;
        match self.db.get_cf(cf, chunk.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_chunk_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn location_replicas(&self, location: &LocationId) -> Result<Vec<LocationReplicaRow>> {
        let cf = self.cf(CF_LOCATION_REPLICAS)?;
        let prefix: &[u8] = location.as_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(Self::decode_location_row(&value)?);
        }
        Ok(rows)
    }

    fn scan_chunk_replicas(&self) -> Result<Vec<ChunkReplicasRow>> {
        let cf = self.cf(CF_CHUNK_REPLICAS)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(Self::decode_chunk_row(&value)?);
        }
        Ok(rows)
    }

    fn scan_location_replicas(&self) -> Result<Vec<LocationReplicaRow>> {
        let cf = self.cf(CF_LOCATION_REPLICAS)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(Self::decode_location_row(&value)?);
        }
        Ok(rows)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct MemTables {
    chunks: BTreeMap<ChunkId, ChunkReplicasRow>,
    locations: BTreeMap<(LocationId, ChunkId), LocationReplicaRow>,
}

/// In-memory ground store with an availability switch
pub struct MemGroundStore {
    tables: Mutex<MemTables>,
    available: AtomicBool,
}

impl MemGroundStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(MemTables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every operation fail (false) or succeed (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(crate::Error::GroundUnavailable("ground store is offline".into()))
        }
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, MemTables>> {
        self.tables
            .lock()
            .map_err(|_| crate::Error::Internal("ground tables lock poisoned".into()))
    }
}

impl Default for MemGroundStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GroundStore for MemGroundStore {
    fn apply(&self, batch: &[GroundWrite]) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables()?;
        for write in batch {
            match write {
                GroundWrite::PutChunk(row) => {
                    tables.chunks.insert(row.chunk_id, row.clone());
                }
                GroundWrite::DeleteChunk(chunk) => {
                    tables.chunks.remove(chunk);
                }
                GroundWrite::PutLocation(row) => {
                    tables
                        .locations
                        .insert((row.location_uuid, row.chunk_id), row.clone());
                }
                GroundWrite::DeleteLocation { location, chunk } => {
                    tables.locations.remove(&(*location, *chunk));
                }
            }
        }
        Ok(())
    }

    fn get_chunk_replicas(&self, chunk: &ChunkId) -> Result<Option<ChunkReplicasRow>> {
        self.check_available()?;
        Ok(self.tables()?.chunks.get(chunk).cloned())
    }

    fn location_replicas(&self, location: &LocationId) -> Result<Vec<LocationReplicaRow>> {
        self.check_available()?;
        let tables = self.tables()?;
        Ok(tables
            .locations
            .iter()
            .filter(|((loc, _), _)| loc == location)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn scan_chunk_replicas(&self) -> Result<Vec<ChunkReplicasRow>> {
        self.check_available()?;
        Ok(self.tables()?.chunks.values().cloned().collect())
    }

    fn scan_location_replicas(&self) -> Result<Vec<LocationReplicaRow>> {
        self.check_available()?;
        Ok(self.tables()?.locations.values().cloned().collect())
    }
}
