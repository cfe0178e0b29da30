//! Ground mirror
//!
//! A single worker task owns every write to the ground store. Callers enqueue
//! "this chunk changed" requests; the worker recomputes the chunk's projection
//! from the directory, diffs it against what the ground holds and applies the
//! difference as one atomic batch. Because the worker always writes the
//! *current* projection, reordered or duplicated requests converge to the same
//! rows.

use crate::common::{ChunkId, LocationId, Result, METRICS};
use crate::coordinator::directory::ReplicaDirectory;
use crate::coordinator::ground::{ChunkReplicasRow, GroundStore, GroundWrite, LocationReplicaRow};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum MirrorRequest {
    /// Re-project one chunk. `refresh` drops the cached ground row first.
    Sync {
        chunk_id: ChunkId,
        attempt: u32,
        refresh: bool,
    },
    /// Delete `location_replicas` rows unless the current projection still wants them
    DeleteLocationRows(Vec<(LocationId, ChunkId)>),
    /// Reply once every request queued before this one has been handled
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Applied { writes: usize },
    Failed(String),
}

/// Result of one projection attempt, consumed by the reconciliation loop
#[derive(Debug, Clone)]
pub struct MirrorAck {
    pub chunk_id: ChunkId,
    pub attempt: u32,
    pub outcome: MirrorOutcome,
}

/// Cheap cloneable sender side of the mirror queue
#[derive(Clone)]
pub struct MirrorHandle {
    tx: mpsc::UnboundedSender<MirrorRequest>,
}

impl MirrorHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MirrorRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, request: MirrorRequest) {
        if let Err(e) = self.tx.send(request) {
            tracing::debug!("Ground mirror is gone, dropping {:?}", e.0);
        }
    }

    pub fn sync(&self, chunk_id: ChunkId) {
        self.send(MirrorRequest::Sync {
            chunk_id,
            attempt: 0,
            refresh: false,
        });
    }

    /// Re-project against a fresh read of the ground row
    pub fn resync(&self, chunk_id: ChunkId) {
        self.send(MirrorRequest::Sync {
            chunk_id,
            attempt: 0,
            refresh: true,
        });
    }

    pub fn retry(&self, chunk_id: ChunkId, attempt: u32) {
        self.send(MirrorRequest::Sync {
            chunk_id,
            attempt,
            refresh: true,
        });
    }

    pub fn delete_location_rows(&self, rows: Vec<(LocationId, ChunkId)>) {
        if !rows.is_empty() {
            self.send(MirrorRequest::DeleteLocationRows(rows));
        }
    }

    /// Wait until everything enqueued so far has reached the worker's store
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MirrorRequest::Flush(tx))
            .map_err(|_| crate::Error::Internal("ground mirror stopped".into()))?;
        rx.await
            .map_err(|_| crate::Error::Internal("ground mirror stopped".into()))
    }

    pub fn shutdown(&self) {
        self.send(MirrorRequest::Shutdown);
    }
}

/// Writes needed to move the ground rows of `chunk_id` from `previous` to `desired`
pub fn projection_diff(
    chunk_id: ChunkId,
    previous: Option<&ChunkReplicasRow>,
    desired: Option<&ChunkReplicasRow>,
) -> Vec<GroundWrite> {
    let mut writes = Vec::new();

    let before: BTreeMap<LocationId, &str> = previous
        .map(|row| {
            row.replicas
                .iter()
                .map(|r| (r.location_uuid, r.medium.as_str()))
                .collect()
        })
        .unwrap_or_default();
    let after: BTreeMap<LocationId, &str> = desired
        .map(|row| {
            row.replicas
                .iter()
                .map(|r| (r.location_uuid, r.medium.as_str()))
                .collect()
        })
        .unwrap_or_default();

    for location in before.keys() {
        if !after.contains_key(location) {
            writes.push(GroundWrite::DeleteLocation {
                location: *location,
                chunk: chunk_id,
            });
        }
    }
    for (location, medium) in &after {
        if before.get(location) != Some(medium) {
            writes.push(GroundWrite::PutLocation(LocationReplicaRow {
                location_uuid: *location,
                chunk_id,
                medium: medium.to_string(),
            }));
        }
    }

    match (previous, desired) {
        (_, Some(row)) if previous != desired => writes.push(GroundWrite::PutChunk(row.clone())),
        (Some(_), None) => writes.push(GroundWrite::DeleteChunk(chunk_id)),
        _ => {}
    }

    writes
}

/// The worker. Create with [`GroundMirror::new`] and drive with [`GroundMirror::run`].
pub struct GroundMirror {
    directory: Arc<ReplicaDirectory>,
    ground: Arc<dyn GroundStore>,
    requests: mpsc::UnboundedReceiver<MirrorRequest>,
    acks: mpsc::UnboundedSender<MirrorAck>,
    /// Last row known to be in the ground store; `None` means no row
    cache: HashMap<ChunkId, Option<ChunkReplicasRow>>,
}

impl GroundMirror {
    pub fn new(
        directory: Arc<ReplicaDirectory>,
        ground: Arc<dyn GroundStore>,
        requests: mpsc::UnboundedReceiver<MirrorRequest>,
        acks: mpsc::UnboundedSender<MirrorAck>,
    ) -> Self {
        Self {
            directory,
            ground,
            requests,
            acks,
            cache: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Ground mirror started");
        let mut pending: Vec<MirrorRequest> = Vec::new();

        while let Some(first) = self.requests.recv().await {
            pending.push(first);
            while let Ok(next) = self.requests.try_recv() {
                pending.push(next);
            }
            if !self.handle_batch(std::mem::take(&mut pending)) {
                break;
            }
        }
        tracing::info!("Ground mirror stopped");
    }

    /// Handle a drained batch in order, coalescing repeated syncs of a chunk.
    /// Returns false on shutdown.
    fn handle_batch(&mut self, batch: Vec<MirrorRequest>) -> bool {
        let mut syncs: Vec<(ChunkId, u32, bool)> = Vec::new();

        for request in batch {
            match request {
                MirrorRequest::Sync {
                    chunk_id,
                    attempt,
                    refresh,
                } => match syncs.iter_mut().find(|(c, _, _)| *c == chunk_id) {
                    Some(existing) => {
                        existing.1 = existing.1.max(attempt);
                        existing.2 |= refresh;
                    }
                    None => syncs.push((chunk_id, attempt, refresh)),
                },
                MirrorRequest::DeleteLocationRows(rows) => {
                    self.drain_syncs(&mut syncs);
                    self.delete_location_rows(rows);
                }
                MirrorRequest::Flush(reply) => {
                    self.drain_syncs(&mut syncs);
                    let _ = reply.send(());
                }
                MirrorRequest::Shutdown => {
                    self.drain_syncs(&mut syncs);
                    return false;
                }
            }
        }
        self.drain_syncs(&mut syncs);
        true
    }

    fn drain_syncs(&mut self, syncs: &mut Vec<(ChunkId, u32, bool)>) {
        for (chunk_id, attempt, refresh) in syncs.drain(..) {
            let outcome = self.sync_chunk(chunk_id, refresh);
            let _ = self.acks.send(MirrorAck {
                chunk_id,
                attempt,
                outcome,
            });
        }
    }

    /// Bring the ground rows of one chunk in line with its current projection
    pub fn sync_chunk(&mut self, chunk_id: ChunkId, refresh: bool) -> MirrorOutcome {
        if refresh {
            self.cache.remove(&chunk_id);
        }

        let previous = match self.cache.get(&chunk_id) {
            Some(row) => row.clone(),
            None => match self.ground.get_chunk_replicas(&chunk_id) {
                Ok(row) => row,
                Err(e) => {
                    METRICS.ground_failures.inc();
                    tracing::warn!("Ground read for {} failed: {}", chunk_id, e);
                    return MirrorOutcome::Failed(e.to_string());
                }
            },
        };
        let desired = self.directory.ground_projection(&chunk_id);

        let writes = projection_diff(chunk_id, previous.as_ref(), desired.as_ref());
        if writes.is_empty() {
            self.cache.insert(chunk_id, desired);
            return MirrorOutcome::Applied { writes: 0 };
        }

        let start = Instant::now();
        match self.ground.apply(&writes) {
            Ok(()) => {
                METRICS.ground_latency.observe_duration(start.elapsed());
                METRICS.ground_batches.inc();
                let deletes = writes.iter().filter(|w| w.is_delete()).count();
                METRICS.ground_rows_deleted.add(deletes as u64);
                METRICS.ground_rows_written.add((writes.len() - deletes) as u64);
                tracing::debug!("Projected {} ({} ground writes)", chunk_id, writes.len());

                if desired.is_some() {
                    self.cache.insert(chunk_id, desired);
                } else {
                    // Removed chunks never come back; keep the cache bounded
                    self.cache.remove(&chunk_id);
                }
                MirrorOutcome::Applied {
                    writes: writes.len(),
                }
            }
            Err(e) => {
                METRICS.ground_failures.inc();
                self.cache.remove(&chunk_id);
                tracing::warn!("Ground batch for {} failed: {}", chunk_id, e);
                MirrorOutcome::Failed(e.to_string())
            }
        }
    }

    fn delete_location_rows(&mut self, rows: Vec<(LocationId, ChunkId)>) {
        let writes: Vec<GroundWrite> = rows
            .into_iter()
            .filter(|(location, chunk)| {
                !self.directory.ground_projection(chunk).is_some_and(|row| {
                    row.replicas.iter().any(|r| r.location_uuid == *location)
                })
            })
            .map(|(location, chunk)| GroundWrite::DeleteLocation { location, chunk })
            .collect();
        if writes.is_empty() {
            return;
        }

        match self.ground.apply(&writes) {
            Ok(()) => {
                METRICS.ground_batches.inc();
                METRICS.ground_rows_deleted.add(writes.len() as u64);
                tracing::info!("Deleted {} orphaned location rows", writes.len());
            }
            Err(e) => {
                METRICS.ground_failures.inc();
                tracing::warn!("Deleting orphaned location rows failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StoredReplica;

    fn row(chunk_id: ChunkId, replicas: &[(LocationId, &str)]) -> ChunkReplicasRow {
        let replicas: Vec<StoredReplica> = replicas
            .iter()
            .map(|(loc, medium)| StoredReplica::new(*loc, medium.to_string()))
            .collect();
        ChunkReplicasRow {
            chunk_id,
            last_seen_replicas: replicas.clone(),
            replicas,
        }
    }

    #[test]
    fn test_diff_from_nothing() {
        let chunk = ChunkId::new();
        let a = LocationId::new();
        let b = LocationId::new();
        let desired = row(chunk, &[(a, "ssd"), (b, "ssd")]);

        let writes = projection_diff(chunk, None, Some(&desired));
        assert_eq!(writes.len(), 3);
        assert!(writes.contains(&GroundWrite::PutChunk(desired.clone())));
        assert!(writes.iter().all(|w| !w.is_delete()));
    }

    #[test]
    fn test_diff_to_nothing() {
        let chunk = ChunkId::new();
        let a = LocationId::new();
        let previous = row(chunk, &[(a, "ssd")]);

        let writes = projection_diff(chunk, Some(&previous), None);
        assert_eq!(
            writes,
            vec![
                GroundWrite::DeleteLocation {
                    location: a,
                    chunk
                },
                GroundWrite::DeleteChunk(chunk),
            ]
        );
    }

    #[test]
    fn test_diff_is_minimal() {
        let chunk = ChunkId::new();
        let a = LocationId::new();
        let b = LocationId::new();
        let c = LocationId::new();
        let previous = row(chunk, &[(a, "ssd"), (b, "ssd")]);
        let desired = row(chunk, &[(b, "ssd"), (c, "ssd")]);

        let writes = projection_diff(chunk, Some(&previous), Some(&desired));
        assert_eq!(writes.len(), 3);
        assert!(writes.contains(&GroundWrite::DeleteLocation { location: a, chunk }));
        assert!(writes.iter().any(
            |w| matches!(w, GroundWrite::PutLocation(r) if r.location_uuid == c)
        ));
        assert!(projection_diff(chunk, Some(&desired), Some(&desired)).is_empty());
        assert!(projection_diff(chunk, None, None).is_empty());
    }
}
