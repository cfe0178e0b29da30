//! Replica directory
//!
//! The authoritative record of which locations hold which chunk. Every
//! mutation updates the in-memory state synchronously and then asks the ground
//! mirror to re-project the chunk; nothing here waits on the ground store.
//!
//! Chunks are spread over `NUM_SHARDS` mutex-guarded shards, so all mutations
//! of one chunk are serialized while different shards proceed in parallel. A
//! second sharded map indexes chunks by location for the reconciliation loop.
//! Lock order is always chunk shard, then location, then index shard.

use crate::common::{
    in_rollout, shard_index, ChunkId, LocationId, ReplicaTracking, Result, StoredReplica, METRICS,
};
use crate::coordinator::dynconfig::ConfigSnapshot;
use crate::coordinator::ground::{ChunkReplicasRow, GroundStore};
use crate::coordinator::mirror::MirrorHandle;
use crate::coordinator::registry::LocationRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const NUM_SHARDS: usize = 64;

/// A replica as recorded by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub medium: String,
    pub tracking: ReplicaTracking,
    /// Location `down_epoch` when the replica was last announced
    pub location_epoch: u64,
}

#[derive(Debug)]
struct ChunkEntry {
    replication_factor: u32,
    sequoia: bool,
    replicas: BTreeMap<LocationId, ReplicaEntry>,
    last_seen: BTreeMap<LocationId, ReplicaEntry>,
    underreplicated_since: Option<Instant>,
}

impl ChunkEntry {
    fn new(replication_factor: u32, sequoia: bool) -> Self {
        Self {
            replication_factor,
            sequoia,
            replicas: BTreeMap::new(),
            last_seen: BTreeMap::new(),
            underreplicated_since: Some(Instant::now()),
        }
    }

    fn refresh_underreplication(&mut self) {
        let under = (self.replicas.len() as u32) < self.replication_factor;
        match (under, self.underreplicated_since) {
            (true, None) => self.underreplicated_since = Some(Instant::now()),
            (false, Some(_)) => self.underreplicated_since = None,
            _ => {}
        }
    }

    fn status(&self) -> ReplicationStatus {
        let count = self.replicas.len() as u32;
        ReplicationStatus {
            underreplicated: count < self.replication_factor,
            overreplicated: count > self.replication_factor,
            lost: count == 0 && !self.last_seen.is_empty(),
        }
    }

    fn subset(&self, tracking: ReplicaTracking) -> Vec<StoredReplica> {
        self.replicas
            .iter()
            .filter(|(_, r)| r.tracking == tracking)
            .map(|(loc, r)| StoredReplica::new(*loc, r.medium.clone()))
            .collect()
    }

    fn has_sequoia_replicas(&self) -> bool {
        self.replicas.values().any(|r| r.tracking.is_sequoia())
    }
}

/// Replication health of one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub underreplicated: bool,
    pub overreplicated: bool,
    pub lost: bool,
}

/// Authoritative view of one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkView {
    pub chunk_id: ChunkId,
    pub replication_factor: u32,
    pub sequoia: bool,
    pub stored_replicas: Vec<StoredReplica>,
    pub stored_sequoia_replicas: Vec<StoredReplica>,
    pub stored_master_replicas: Vec<StoredReplica>,
    pub last_seen_replicas: Vec<StoredReplica>,
    pub status: ReplicationStatus,
}

/// Partitioned read views served to inspection commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaViews {
    pub stored_replicas: Vec<StoredReplica>,
    pub stored_sequoia_replicas: Vec<StoredReplica>,
    pub stored_master_replicas: Vec<StoredReplica>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Added(ReplicaTracking),
    AlreadyPresent(ReplicaTracking),
    StaleChunk,
    StaleLocation,
    LocationOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropOutcome {
    Dropped(ReplicaTracking),
    NotPresent,
    StaleChunk,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    tracking: ReplicaTracking,
    /// Sequoia replica already dropped; released once the ground deletion is acknowledged
    pending_removal: bool,
}

type ChunkShard = HashMap<ChunkId, ChunkEntry>;
type IndexShard = HashMap<LocationId, HashMap<ChunkId, IndexEntry>>;

pub struct ReplicaDirectory {
    registry: Arc<LocationRegistry>,
    config: Arc<ConfigSnapshot>,
    ground: Arc<dyn GroundStore>,
    mirror: MirrorHandle,
    shards: Vec<Mutex<ChunkShard>>,
    index: Vec<Mutex<IndexShard>>,
    pending_releases: Mutex<HashMap<ChunkId, BTreeSet<LocationId>>>,
}

impl ReplicaDirectory {
    pub fn new(
        registry: Arc<LocationRegistry>,
        config: Arc<ConfigSnapshot>,
        ground: Arc<dyn GroundStore>,
        mirror: MirrorHandle,
    ) -> Self {
        Self {
            registry,
            config,
            ground,
            mirror,
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            index: (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            pending_releases: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<ConfigSnapshot> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.registry
    }

    fn shard(&self, chunk_id: &ChunkId) -> MutexGuard<'_, ChunkShard> {
        let idx = shard_index(chunk_id.as_bytes(), NUM_SHARDS);
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index_shard(&self, location: &LocationId) -> MutexGuard<'_, IndexShard> {
        let idx = shard_index(location.as_bytes(), NUM_SHARDS);
        self.index[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn index_insert(&self, location: LocationId, chunk_id: ChunkId, tracking: ReplicaTracking) {
        self.index_shard(&location).entry(location).or_default().insert(
            chunk_id,
            IndexEntry {
                tracking,
                pending_removal: false,
            },
        );
    }

    fn index_remove(&self, location: &LocationId, chunk_id: &ChunkId) {
        let mut shard = self.index_shard(location);
        if let Some(chunks) = shard.get_mut(location) {
            chunks.remove(chunk_id);
            if chunks.is_empty() {
                shard.remove(location);
            }
        }
    }

    /// Unindex a dropped replica, or park it until the ground confirms the drop
    fn index_release(
        &self,
        location: LocationId,
        chunk_id: ChunkId,
        tracking: ReplicaTracking,
        immediate: bool,
    ) {
        if tracking == ReplicaTracking::Master || immediate {
            self.index_remove(&location, &chunk_id);
            return;
        }

        let parked = {
            let mut shard = self.index_shard(&location);
            match shard.get_mut(&location).and_then(|c| c.get_mut(&chunk_id)) {
                Some(entry) => {
                    entry.pending_removal = true;
                    true
                }
                None => false,
            }
        };
        if parked {
            self.pending_releases
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(chunk_id)
                .or_default()
                .insert(location);
        }
    }

    // === Chunk lifecycle ===

    /// Register a chunk on its first write. Repeated creation is a no-op;
    /// returns whether the chunk was new.
    pub fn create_chunk(&self, chunk_id: ChunkId, replication_factor: u32) -> Result<bool> {
        let cfg = self.config.snapshot();
        validate_replication_factor(replication_factor, cfg.max_replication_factor)?;

        let mut shard = self.shard(&chunk_id);
        if shard.contains_key(&chunk_id) {
            tracing::debug!("Chunk {} already exists", chunk_id);
            return Ok(false);
        }
        let sequoia = in_rollout(&chunk_id, cfg.sequoia_chunk_replicas_percentage);
        shard.insert(chunk_id, ChunkEntry::new(replication_factor, sequoia));
        drop(shard);

        METRICS.chunks_created.inc();
        METRICS.chunks.inc();
        tracing::debug!(
            "Created chunk {} (rf={}, sequoia={})",
            chunk_id,
            replication_factor,
            sequoia
        );
        Ok(true)
    }

    /// A location confirmed it holds a copy of the chunk
    pub fn record_replica(&self, chunk_id: ChunkId, location: LocationId) -> RecordOutcome {
        let cfg = self.config.snapshot();

        // The location mutex is held across the insert, so a concurrent down
        // transition either rejects this record or sees it in its sweep.
        let mut shard = self.shard(&chunk_id);
        let outcome = self.registry.with_replica_target(&location, |target| {
            if !target.state.can_host() {
                return RecordOutcome::LocationOffline;
            }
            let Some(entry) = shard.get_mut(&chunk_id) else {
                return RecordOutcome::StaleChunk;
            };
            if let Some(existing) = entry.replicas.get_mut(&location) {
                existing.location_epoch = target.down_epoch;
                return RecordOutcome::AlreadyPresent(existing.tracking);
            }

            let tracking = if entry.sequoia && target.sequoia_medium {
                ReplicaTracking::Sequoia
            } else {
                ReplicaTracking::Master
            };
            let replica = ReplicaEntry {
                medium: target.medium.clone(),
                tracking,
                location_epoch: target.down_epoch,
            };
            entry.replicas.insert(location, replica.clone());
            entry.last_seen.insert(location, replica);
            entry.refresh_underreplication();

            if tracking == ReplicaTracking::Master || cfg.store_sequoia_replicas_on_master {
                self.index_insert(location, chunk_id, tracking);
            }
            if tracking.is_sequoia() {
                self.mirror.sync(chunk_id);
            }
            RecordOutcome::Added(tracking)
        });
        drop(shard);

        match outcome {
            None => {
                METRICS.stale_events.inc();
                tracing::debug!("Replica of {} on unknown location {}", chunk_id, location);
                RecordOutcome::StaleLocation
            }
            Some(RecordOutcome::LocationOffline) => {
                METRICS.stale_events.inc();
                tracing::debug!("Replica of {} on offline location {} ignored", chunk_id, location);
                RecordOutcome::LocationOffline
            }
            Some(RecordOutcome::StaleChunk) => {
                METRICS.stale_events.inc();
                tracing::debug!("Replica of removed chunk {} on {}", chunk_id, location);
                RecordOutcome::StaleChunk
            }
            Some(RecordOutcome::Added(tracking)) => {
                METRICS.replicas_recorded.inc();
                tracing::debug!("Recorded {} replica of {} on {}", tracking, chunk_id, location);
                RecordOutcome::Added(tracking)
            }
            Some(outcome) => outcome,
        }
    }

    /// A location no longer holds (or can no longer serve) a copy
    pub fn drop_replica(&self, chunk_id: ChunkId, location: LocationId) -> DropOutcome {
        self.drop_replica_if(chunk_id, location, |_| true)
    }

    /// Drop a replica only if it was announced before the location's
    /// `down_epoch` reached `down_epoch`. Replicas re-announced after the
    /// location recovered are kept.
    pub fn drop_replica_before(
        &self,
        chunk_id: ChunkId,
        location: LocationId,
        down_epoch: u64,
    ) -> DropOutcome {
        self.drop_replica_if(chunk_id, location, |replica| {
            replica.location_epoch < down_epoch
        })
    }

    fn drop_replica_if(
        &self,
        chunk_id: ChunkId,
        location: LocationId,
        predicate: impl FnOnce(&ReplicaEntry) -> bool,
    ) -> DropOutcome {
        let cfg = self.config.snapshot();

        let mut shard = self.shard(&chunk_id);
        let Some(entry) = shard.get_mut(&chunk_id) else {
            drop(shard);
            // The chunk is gone; make sure no index entry outlives it
            self.index_remove(&location, &chunk_id);
            return DropOutcome::StaleChunk;
        };
        if !entry.replicas.get(&location).is_some_and(predicate) {
            return DropOutcome::NotPresent;
        }
        let Some(replica) = entry.replicas.remove(&location) else {
            return DropOutcome::NotPresent;
        };
        entry.refresh_underreplication();
        self.index_release(
            location,
            chunk_id,
            replica.tracking,
            cfg.processed_removed_sequoia_replicas_on_master,
        );
        drop(shard);

        METRICS.replicas_dropped.inc();
        tracing::debug!(
            "Dropped {} replica of {} on {}",
            replica.tracking,
            chunk_id,
            location
        );

        if replica.tracking.is_sequoia() {
            self.mirror.sync(chunk_id);
        }
        DropOutcome::Dropped(replica.tracking)
    }

    /// Update the target replication factor
    pub fn set_replication_factor(&self, chunk_id: ChunkId, replication_factor: u32) -> Result<()> {
        let cfg = self.config.snapshot();
        validate_replication_factor(replication_factor, cfg.max_replication_factor)?;

        let mut shard = self.shard(&chunk_id);
        let entry = shard
            .get_mut(&chunk_id)
            .ok_or(crate::Error::NoSuchChunk(chunk_id))?;
        if entry.replication_factor != replication_factor {
            tracing::info!(
                "Chunk {} replication factor {} -> {}",
                chunk_id,
                entry.replication_factor,
                replication_factor
            );
        }
        entry.replication_factor = replication_factor;
        entry.refresh_underreplication();
        Ok(())
    }

    /// Remove a chunk together with every replica reference. Returns false
    /// if the chunk was already gone.
    pub fn remove_chunk(&self, chunk_id: ChunkId) -> bool {
        let cfg = self.config.snapshot();

        let mut shard = self.shard(&chunk_id);
        let Some(entry) = shard.remove(&chunk_id) else {
            tracing::debug!("Chunk {} already removed", chunk_id);
            return false;
        };
        for (location, replica) in &entry.replicas {
            self.index_release(
                *location,
                chunk_id,
                replica.tracking,
                cfg.processed_removed_sequoia_replicas_on_master,
            );
        }
        drop(shard);

        METRICS.chunks_removed.inc();
        METRICS.chunks.dec();
        METRICS
            .replicas_dropped
            .add(entry.replicas.len() as u64);
        tracing::info!(
            "Removed chunk {} ({} replicas dropped)",
            chunk_id,
            entry.replicas.len()
        );

        if entry.sequoia {
            self.mirror.sync(chunk_id);
        }
        true
    }

    // === Reads ===

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.shard(chunk_id).contains_key(chunk_id)
    }

    /// Authoritative state of a chunk
    pub fn query(&self, chunk_id: ChunkId) -> Result<ChunkView> {
        let shard = self.shard(&chunk_id);
        let entry = shard
            .get(&chunk_id)
            .ok_or(crate::Error::NoSuchChunk(chunk_id))?;

        let stored_sequoia_replicas = entry.subset(ReplicaTracking::Sequoia);
        let stored_master_replicas = entry.subset(ReplicaTracking::Master);
        Ok(ChunkView {
            chunk_id,
            replication_factor: entry.replication_factor,
            sequoia: entry.sequoia,
            stored_replicas: union(&stored_sequoia_replicas, &stored_master_replicas),
            stored_sequoia_replicas,
            stored_master_replicas,
            last_seen_replicas: entry
                .last_seen
                .iter()
                .map(|(loc, r)| StoredReplica::new(*loc, r.medium.clone()))
                .collect(),
            status: entry.status(),
        })
    }

    /// Read views honoring `fetch_replicas_from_sequoia`: the sequoia part may
    /// come from the ground store and lag behind the authoritative state.
    pub fn replica_views(&self, chunk_id: ChunkId) -> Result<ReplicaViews> {
        let cfg = self.config.snapshot();
        let view = self.query(chunk_id)?;

        let mut sequoia = view.stored_sequoia_replicas;
        if cfg.fetch_replicas_from_sequoia && view.sequoia {
            match self.ground.get_chunk_replicas(&chunk_id) {
                Ok(row) => {
                    let master: BTreeSet<LocationId> = view
                        .stored_master_replicas
                        .iter()
                        .map(|r| r.location_uuid)
                        .collect();
                    sequoia = row
                        .map(|row| row.replicas)
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|r| !master.contains(&r.location_uuid))
                        .collect();
                }
                Err(e) => {
                    tracing::warn!(
                        "Falling back to master state for {} sequoia replicas: {}",
                        chunk_id,
                        e
                    );
                }
            }
        }

        Ok(ReplicaViews {
            stored_replicas: union(&sequoia, &view.stored_master_replicas),
            stored_sequoia_replicas: sequoia,
            stored_master_replicas: view.stored_master_replicas,
        })
    }

    pub fn stored_replicas(&self, chunk_id: ChunkId) -> Result<Vec<StoredReplica>> {
        Ok(self.replica_views(chunk_id)?.stored_replicas)
    }

    pub fn stored_sequoia_replicas(&self, chunk_id: ChunkId) -> Result<Vec<StoredReplica>> {
        Ok(self.replica_views(chunk_id)?.stored_sequoia_replicas)
    }

    pub fn stored_master_replicas(&self, chunk_id: ChunkId) -> Result<Vec<StoredReplica>> {
        Ok(self.replica_views(chunk_id)?.stored_master_replicas)
    }

    pub fn last_seen_replicas(&self, chunk_id: ChunkId) -> Result<Vec<StoredReplica>> {
        Ok(self.query(chunk_id)?.last_seen_replicas)
    }

    /// Ground rows the chunk should have right now (recompute rule). `None`
    /// means the chunk must have no rows at all.
    pub fn ground_projection(&self, chunk_id: &ChunkId) -> Option<ChunkReplicasRow> {
        let shard = self.shard(chunk_id);
        let entry = shard.get(chunk_id)?;
        if !entry.has_sequoia_replicas() {
            return None;
        }
        Some(ChunkReplicasRow {
            chunk_id: *chunk_id,
            replicas: entry.subset(ReplicaTracking::Sequoia),
            last_seen_replicas: entry
                .last_seen
                .iter()
                .filter(|(_, r)| r.tracking.is_sequoia())
                .map(|(loc, r)| StoredReplica::new(*loc, r.medium.clone()))
                .collect(),
        })
    }

    /// Chunks the master's index believes are stored on a location
    pub fn location_chunks(&self, location: &LocationId) -> Vec<ChunkId> {
        self.index_shard(location)
            .get(location)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of indexed replicas on a location, split by tracking
    pub fn location_replica_counts(&self, location: &LocationId) -> (usize, usize) {
        self.index_shard(location)
            .get(location)
            .map(|chunks| {
                let sequoia = chunks
                    .values()
                    .filter(|e| e.tracking.is_sequoia() && !e.pending_removal)
                    .count();
                let master = chunks
                    .values()
                    .filter(|e| e.tracking == ReplicaTracking::Master)
                    .count();
                (sequoia, master)
            })
            .unwrap_or_default()
    }

    /// The ground store acknowledged a projection of `chunk_id`: release
    /// index entries that were waiting for it.
    pub fn release_pending_removals(&self, chunk_id: &ChunkId) -> usize {
        let locations = self
            .pending_releases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(chunk_id)
            .unwrap_or_default();

        let mut released = 0;
        for location in locations {
            let mut shard = self.index_shard(&location);
            let Some(chunks) = shard.get_mut(&location) else {
                continue;
            };
            if chunks.get(chunk_id).is_some_and(|e| e.pending_removal) {
                chunks.remove(chunk_id);
                released += 1;
            }
            if chunks.is_empty() {
                shard.remove(&location);
            }
        }
        released
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            ids.extend(shard.keys().copied());
        }
        ids.sort();
        ids
    }

    pub fn chunk_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }

    /// Chunks that lost every replica they were ever seen with
    pub fn lost_chunks(&self) -> Vec<ChunkId> {
        self.collect_chunks(|entry| entry.status().lost)
    }

    /// Chunks underreplicated for at least `threshold`
    pub fn degraded_chunks(&self, threshold: Duration) -> Vec<ChunkId> {
        self.collect_chunks(|entry| {
            entry
                .underreplicated_since
                .is_some_and(|since| since.elapsed() >= threshold)
        })
    }

    fn collect_chunks(&self, predicate: impl Fn(&ChunkEntry) -> bool) -> Vec<ChunkId> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            ids.extend(
                shard
                    .iter()
                    .filter(|(_, entry)| predicate(entry))
                    .map(|(id, _)| *id),
            );
        }
        ids.sort();
        ids
    }
}

fn validate_replication_factor(requested: u32, max: u32) -> Result<()> {
    if requested == 0 || requested > max {
        return Err(crate::Error::InvalidReplicationFactor { requested, max });
    }
    Ok(())
}

fn union(a: &[StoredReplica], b: &[StoredReplica]) -> Vec<StoredReplica> {
    let mut all: Vec<StoredReplica> = a.iter().chain(b.iter()).cloned().collect();
    all.sort();
    all.dedup_by(|x, y| x.location_uuid == y.location_uuid);
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ChunkManagerConfig, LocationState, MediumConfig, DEFAULT_MEDIUM};
    use crate::coordinator::ground::MemGroundStore;
    use crate::coordinator::mirror::MirrorRequest;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        directory: Arc<ReplicaDirectory>,
        registry: Arc<LocationRegistry>,
        requests: UnboundedReceiver<MirrorRequest>,
    }

    fn fixture(cm: ChunkManagerConfig) -> Fixture {
        let registry = Arc::new(LocationRegistry::new(&[
            MediumConfig {
                name: "ssd".into(),
                enable_sequoia_replicas: true,
            },
            MediumConfig {
                name: "hdd".into(),
                enable_sequoia_replicas: false,
            },
        ]));
        let (mirror, requests) = MirrorHandle::channel();
        let directory = Arc::new(ReplicaDirectory::new(
            registry.clone(),
            Arc::new(ConfigSnapshot::new(cm)),
            Arc::new(MemGroundStore::new()),
            mirror,
        ));
        Fixture {
            directory,
            registry,
            requests,
        }
    }

    fn sequoia_config() -> ChunkManagerConfig {
        ChunkManagerConfig {
            sequoia_chunk_replicas_percentage: 100,
            ..Default::default()
        }
    }

    fn location(registry: &LocationRegistry, medium: &str) -> LocationId {
        let id = LocationId::new();
        registry.register_location(id, "node:9012", medium).unwrap();
        id
    }

    fn drain_syncs(requests: &mut UnboundedReceiver<MirrorRequest>) -> usize {
        let mut n = 0;
        while let Ok(req) = requests.try_recv() {
            if matches!(req, MirrorRequest::Sync { .. }) {
                n += 1;
            }
        }
        n
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let loc = location(&fx.registry, "ssd");
        assert!(fx.directory.create_chunk(chunk, 3).unwrap());
        assert!(!fx.directory.create_chunk(chunk, 3).unwrap());

        assert_eq!(
            fx.directory.record_replica(chunk, loc),
            RecordOutcome::Added(ReplicaTracking::Sequoia)
        );
        let once = fx.directory.query(chunk).unwrap();
        assert_eq!(
            fx.directory.record_replica(chunk, loc),
            RecordOutcome::AlreadyPresent(ReplicaTracking::Sequoia)
        );
        let twice = fx.directory.query(chunk).unwrap();

        assert_eq!(once.stored_replicas, twice.stored_replicas);
        assert_eq!(twice.stored_replicas.len(), 1);
        assert_eq!(drain_syncs(&mut fx.requests), 1);
    }

    #[test]
    fn test_mixed_media_partition() {
        let mut fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let ssd = location(&fx.registry, "ssd");
        let hdd = location(&fx.registry, "hdd");
        fx.directory.create_chunk(chunk, 2).unwrap();

        fx.directory.record_replica(chunk, ssd);
        fx.directory.record_replica(chunk, hdd);

        let view = fx.directory.query(chunk).unwrap();
        assert_eq!(view.stored_replicas.len(), 2);
        assert_eq!(view.stored_sequoia_replicas.len(), 1);
        assert_eq!(view.stored_master_replicas.len(), 1);
        assert_eq!(view.stored_sequoia_replicas[0].location_uuid, ssd);
        assert_eq!(view.stored_sequoia_replicas[0].medium, "ssd");
        assert_eq!(view.stored_master_replicas[0].location_uuid, hdd);

        // Only the sequoia replica is mirrored
        assert_eq!(drain_syncs(&mut fx.requests), 1);
        let row = fx.directory.ground_projection(&chunk).unwrap();
        assert_eq!(row.replicas, view.stored_sequoia_replicas);
    }

    #[test]
    fn test_chunk_outside_rollout_is_master_tracked() {
        let mut fx = fixture(ChunkManagerConfig::default());
        let chunk = ChunkId::new();
        let ssd = location(&fx.registry, "ssd");
        fx.directory.create_chunk(chunk, 1).unwrap();

        assert_eq!(
            fx.directory.record_replica(chunk, ssd),
            RecordOutcome::Added(ReplicaTracking::Master)
        );
        assert!(fx.directory.ground_projection(&chunk).is_none());
        assert_eq!(drain_syncs(&mut fx.requests), 0);
    }

    #[test]
    fn test_policy_change_does_not_reclassify() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let a = location(&fx.registry, "ssd");
        let b = location(&fx.registry, "ssd");
        fx.directory.create_chunk(chunk, 2).unwrap();
        fx.directory.record_replica(chunk, a);

        fx.registry.set_medium_policy("ssd", false).unwrap();
        fx.directory.record_replica(chunk, b);
        // Re-announcement keeps the original classification
        fx.directory.record_replica(chunk, a);

        let view = fx.directory.query(chunk).unwrap();
        assert_eq!(view.stored_sequoia_replicas.len(), 1);
        assert_eq!(view.stored_sequoia_replicas[0].location_uuid, a);
        assert_eq!(view.stored_master_replicas[0].location_uuid, b);
    }

    #[test]
    fn test_drop_and_last_seen() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let locs: Vec<LocationId> = (0..3).map(|_| location(&fx.registry, "ssd")).collect();
        fx.directory.create_chunk(chunk, 3).unwrap();
        for loc in &locs {
            fx.directory.record_replica(chunk, *loc);
        }

        assert_eq!(
            fx.directory.drop_replica(chunk, locs[0]),
            DropOutcome::Dropped(ReplicaTracking::Sequoia)
        );
        assert_eq!(fx.directory.drop_replica(chunk, locs[0]), DropOutcome::NotPresent);

        let view = fx.directory.query(chunk).unwrap();
        assert_eq!(view.stored_replicas.len(), 2);
        assert_eq!(view.last_seen_replicas.len(), 3);
        assert!(view.status.underreplicated);

        fx.directory.drop_replica(chunk, locs[1]);
        fx.directory.drop_replica(chunk, locs[2]);
        let view = fx.directory.query(chunk).unwrap();
        assert!(view.stored_replicas.is_empty());
        assert_eq!(view.last_seen_replicas.len(), 3);
        assert!(view.status.lost);
        assert!(fx.directory.ground_projection(&chunk).is_none());
        assert_eq!(fx.directory.lost_chunks(), vec![chunk]);
    }

    #[test]
    fn test_removed_chunk_is_not_resurrected() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let loc = location(&fx.registry, "ssd");
        fx.directory.create_chunk(chunk, 1).unwrap();
        fx.directory.record_replica(chunk, loc);

        assert!(fx.directory.remove_chunk(chunk));
        assert!(!fx.directory.remove_chunk(chunk));

        assert_eq!(fx.directory.record_replica(chunk, loc), RecordOutcome::StaleChunk);
        assert_eq!(fx.directory.drop_replica(chunk, loc), DropOutcome::StaleChunk);
        assert!(fx.directory.ground_projection(&chunk).is_none());
        assert!(fx.directory.location_chunks(&loc).is_empty());
        assert!(matches!(
            fx.directory.query(chunk),
            Err(crate::Error::NoSuchChunk(_))
        ));
    }

    #[test]
    fn test_offline_or_unknown_location() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let loc = location(&fx.registry, "ssd");
        fx.directory.create_chunk(chunk, 1).unwrap();

        fx.registry.with_location(&loc, |info| {
            info.set_state(crate::common::LocationState::Down, 0)
        });
        assert_eq!(fx.directory.record_replica(chunk, loc), RecordOutcome::LocationOffline);
        assert_eq!(
            fx.directory.record_replica(chunk, LocationId::new()),
            RecordOutcome::StaleLocation
        );
        assert!(fx.directory.query(chunk).unwrap().stored_replicas.is_empty());
    }

    #[test]
    fn test_replication_factor_validation() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        assert!(matches!(
            fx.directory.set_replication_factor(chunk, 3),
            Err(crate::Error::NoSuchChunk(_))
        ));
        assert!(fx.directory.create_chunk(chunk, 0).is_err());
        fx.directory.create_chunk(chunk, 2).unwrap();
        assert!(fx.directory.set_replication_factor(chunk, 0).is_err());
        assert!(fx.directory.set_replication_factor(chunk, 21).is_err());
        fx.directory.set_replication_factor(chunk, 3).unwrap();
        assert_eq!(fx.directory.query(chunk).unwrap().replication_factor, 3);
    }

    #[test]
    fn test_overreplicated_after_lowering_factor() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        fx.directory.create_chunk(chunk, 3).unwrap();
        for _ in 0..3 {
            let loc = location(&fx.registry, DEFAULT_MEDIUM);
            fx.directory.record_replica(chunk, loc);
        }
        fx.directory.set_replication_factor(chunk, 2).unwrap();
        let status = fx.directory.query(chunk).unwrap().status;
        assert!(status.overreplicated);
        assert!(!status.underreplicated);
        assert!(fx.directory.degraded_chunks(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_index_respects_store_on_master() {
        let fx = fixture(ChunkManagerConfig {
            sequoia_chunk_replicas_percentage: 100,
            store_sequoia_replicas_on_master: false,
            ..Default::default()
        });
        let chunk = ChunkId::new();
        let ssd = location(&fx.registry, "ssd");
        let hdd = location(&fx.registry, "hdd");
        fx.directory.create_chunk(chunk, 2).unwrap();
        fx.directory.record_replica(chunk, ssd);
        fx.directory.record_replica(chunk, hdd);

        assert!(fx.directory.location_chunks(&ssd).is_empty());
        assert_eq!(fx.directory.location_chunks(&hdd), vec![chunk]);
    }

    #[test]
    fn test_deferred_index_release() {
        let fx = fixture(ChunkManagerConfig {
            sequoia_chunk_replicas_percentage: 100,
            processed_removed_sequoia_replicas_on_master: false,
            ..Default::default()
        });
        let chunk = ChunkId::new();
        let loc = location(&fx.registry, "ssd");
        fx.directory.create_chunk(chunk, 1).unwrap();
        fx.directory.record_replica(chunk, loc);

        fx.directory.drop_replica(chunk, loc);
        assert_eq!(fx.directory.location_chunks(&loc), vec![chunk]);
        assert_eq!(fx.directory.location_replica_counts(&loc), (0, 0));

        assert_eq!(fx.directory.release_pending_removals(&chunk), 1);
        assert!(fx.directory.location_chunks(&loc).is_empty());
    }

    #[test]
    fn test_concurrent_records_across_chunks() {
        let fx = fixture(sequoia_config());
        let locs: Vec<LocationId> = (0..4).map(|_| location(&fx.registry, "ssd")).collect();
        let chunks: Vec<ChunkId> = (0..64).map(|_| ChunkId::new()).collect();
        for c in &chunks {
            fx.directory.create_chunk(*c, 4).unwrap();
        }

        let handles: Vec<_> = locs
            .iter()
            .map(|loc| {
                let directory = fx.directory.clone();
                let chunks = chunks.clone();
                let loc = *loc;
                std::thread::spawn(move || {
                    for c in chunks {
                        directory.record_replica(c, loc);
                        directory.record_replica(c, loc);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for c in &chunks {
            let view = fx.directory.query(*c).unwrap();
            assert_eq!(view.stored_replicas.len(), 4);
            assert_eq!(view.stored_sequoia_replicas.len(), 4);
            assert!(view.stored_master_replicas.is_empty());
        }
        for loc in &locs {
            assert_eq!(fx.directory.location_chunks(loc).len(), chunks.len());
        }
    }

    #[test]
    fn test_degraded_until_fully_replicated() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        fx.directory.create_chunk(chunk, 2).unwrap();
        fx.directory.record_replica(chunk, location(&fx.registry, "ssd"));

        assert!(fx.directory.query(chunk).unwrap().status.underreplicated);
        assert_eq!(fx.directory.degraded_chunks(Duration::ZERO), vec![chunk]);
        assert!(fx
            .directory
            .degraded_chunks(Duration::from_secs(3600))
            .is_empty());

        fx.directory.record_replica(chunk, location(&fx.registry, "hdd"));
        assert!(fx.directory.degraded_chunks(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_reannouncement_survives_older_sweep() {
        let fx = fixture(sequoia_config());
        let chunk = ChunkId::new();
        let loc = location(&fx.registry, "ssd");
        fx.directory.create_chunk(chunk, 1).unwrap();
        fx.directory.record_replica(chunk, loc);

        let epoch = fx
            .registry
            .with_location(&loc, |info| {
                info.set_state(LocationState::Down, 0);
                info.set_state(LocationState::Up, 0);
                info.down_epoch
            })
            .unwrap();
        assert_eq!(
            fx.directory.record_replica(chunk, loc),
            RecordOutcome::AlreadyPresent(ReplicaTracking::Sequoia)
        );

        assert_eq!(
            fx.directory.drop_replica_before(chunk, loc, epoch),
            DropOutcome::NotPresent
        );
        assert_eq!(fx.directory.query(chunk).unwrap().stored_replicas.len(), 1);
        assert_eq!(
            fx.directory.drop_replica_before(chunk, loc, epoch + 1),
            DropOutcome::Dropped(ReplicaTracking::Sequoia)
        );
    }

    #[test]
    fn test_down_transition_racing_records() {
        let fx = fixture(sequoia_config());
        let loc = location(&fx.registry, "ssd");
        let chunks: Vec<ChunkId> = (0..400).map(|_| ChunkId::new()).collect();
        for chunk in &chunks {
            fx.directory.create_chunk(*chunk, 1).unwrap();
        }

        let directory = fx.directory.clone();
        let to_record = chunks.clone();
        let recorder = std::thread::spawn(move || {
            to_record
                .iter()
                .filter(|c| matches!(directory.record_replica(**c, loc), RecordOutcome::Added(_)))
                .count()
        });

        while fx.directory.location_chunks(&loc).len() < 50 && !recorder.is_finished() {
            std::thread::yield_now();
        }
        let epoch = fx
            .registry
            .with_location(&loc, |info| {
                info.set_state(LocationState::Down, 0);
                info.down_epoch
            })
            .unwrap();
        let mut swept = 0;
        for chunk in fx.directory.location_chunks(&loc) {
            if matches!(
                fx.directory.drop_replica_before(chunk, loc, epoch),
                DropOutcome::Dropped(_)
            ) {
                swept += 1;
            }
        }

        // Every record either lost the race or is visible to the sweep
        let added = recorder.join().unwrap();
        assert_eq!(swept, added);
        for chunk in &chunks {
            assert!(fx.directory.query(*chunk).unwrap().stored_replicas.is_empty());
        }
        assert!(fx.directory.location_chunks(&loc).is_empty());
    }
}
