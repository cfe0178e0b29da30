//! Reconciliation loop
//!
//! Drives location liveness (`up -> suspect -> down -> reaped`), sweeps the
//! replicas of locations that went down, and retries failed ground
//! projections with exponential backoff.
//!
//! The loop is the only writer of location liveness. Liveness events and
//! decommission requests reach it through [`ReconcilerHandle`]; projection
//! results arrive on the mirror's ack channel.

use crate::common::{
    backoff_delay, timestamp_now_millis, ChunkId, LocationId, LocationState, ReconcilerConfig,
    Result, METRICS,
};
use crate::coordinator::directory::{DropOutcome, ReplicaDirectory};
use crate::coordinator::ground::GroundStore;
use crate::coordinator::mirror::{MirrorAck, MirrorHandle, MirrorOutcome};
use crate::coordinator::registry::LocationRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    Up,
    Down,
}

/// Liveness report for one location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationEvent {
    pub location_uuid: LocationId,
    pub timestamp: DateTime<Utc>,
    pub status: LivenessStatus,
}

impl LocationEvent {
    pub fn now(location_uuid: LocationId, status: LivenessStatus) -> Self {
        Self {
            location_uuid,
            timestamp: Utc::now(),
            status,
        }
    }

    fn timestamp_millis(&self) -> u64 {
        self.timestamp.timestamp_millis().max(0) as u64
    }
}

#[derive(Debug, Clone)]
pub enum ReconcilerCommand {
    Liveness(LocationEvent),
    Decommission(LocationId),
}

#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<ReconcilerCommand>,
}

impl ReconcilerHandle {
    pub fn send(&self, command: ReconcilerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| crate::Error::Internal("reconciliation loop stopped".into()))
    }

    pub fn liveness(&self, event: LocationEvent) -> Result<()> {
        self.send(ReconcilerCommand::Liveness(event))
    }

    pub fn decommission(&self, location_uuid: LocationId) -> Result<()> {
        self.send(ReconcilerCommand::Decommission(location_uuid))
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingSweep {
    down_epoch: u64,
    decommission: bool,
}

#[derive(Debug, Clone, Copy)]
struct BacklogEntry {
    attempt: u32,
    /// `None` while a retry is in flight
    due: Option<Instant>,
}

pub struct Reconciler {
    registry: Arc<LocationRegistry>,
    directory: Arc<ReplicaDirectory>,
    ground: Arc<dyn GroundStore>,
    mirror: MirrorHandle,
    config: ReconcilerConfig,
    commands: mpsc::UnboundedReceiver<ReconcilerCommand>,
    acks: mpsc::UnboundedReceiver<MirrorAck>,
    pending_sweeps: HashMap<LocationId, PendingSweep>,
    backlog: HashMap<ChunkId, BacklogEntry>,
    degraded: HashSet<ChunkId>,
}

impl Reconciler {
    pub fn new(
        directory: Arc<ReplicaDirectory>,
        ground: Arc<dyn GroundStore>,
        mirror: MirrorHandle,
        config: ReconcilerConfig,
        acks: mpsc::UnboundedReceiver<MirrorAck>,
    ) -> (Self, ReconcilerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let reconciler = Self {
            registry: directory.registry().clone(),
            directory,
            ground,
            mirror,
            config,
            commands,
            acks,
            pending_sweeps: HashMap::new(),
            backlog: HashMap::new(),
            degraded: HashSet::new(),
        };
        (reconciler, ReconcilerHandle { tx })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Reconciliation loop started (tick {:?}, grace period {:?})",
            self.config.tick_interval(),
            self.config.grace_period()
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(ack) = self.acks.recv() => self.handle_ack(ack),
                _ = ticker.tick() => self.tick(timestamp_now_millis()).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Reconciliation loop stopped");
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn pending_sweeps(&self) -> usize {
        self.pending_sweeps.len()
    }

    pub async fn handle_command(&mut self, command: ReconcilerCommand) {
        match command {
            ReconcilerCommand::Liveness(event) => match event.status {
                LivenessStatus::Up => self.location_up(&event),
                LivenessStatus::Down => {
                    if self.location_down(&event) {
                        self.run_pending_sweeps().await;
                    }
                }
            },
            ReconcilerCommand::Decommission(location_uuid) => {
                let now = timestamp_now_millis();
                let epoch = self.registry.with_location(&location_uuid, |info| {
                    if !info.state.is_offline() {
                        info.set_state(LocationState::Down, now);
                        METRICS.down_transitions.inc();
                    }
                    info.down_epoch
                });
                match epoch {
                    Some(down_epoch) => {
                        tracing::info!("Decommissioning location {}", location_uuid);
                        self.pending_sweeps.insert(
                            location_uuid,
                            PendingSweep {
                                down_epoch,
                                decommission: true,
                            },
                        );
                        self.run_pending_sweeps().await;
                    }
                    None => tracing::debug!("Decommission of unknown location {}", location_uuid),
                }
            }
        }
    }

    fn location_up(&mut self, event: &LocationEvent) {
        let location_uuid = event.location_uuid;
        let at = event.timestamp_millis();
        let recovered = self.registry.with_location(&location_uuid, |info| {
            info.last_heartbeat = info.last_heartbeat.max(at);
            if info.state == LocationState::Up {
                return None;
            }
            let previous = info.state;
            info.set_state(LocationState::Up, timestamp_now_millis());
            Some(previous)
        });

        match recovered {
            None => tracing::debug!("Heartbeat from unknown location {}", location_uuid),
            Some(None) => {}
            Some(Some(previous)) => {
                // A sweep still owed to the old down transition keeps running;
                // it only drops replicas announced before that transition.
                tracing::info!(
                    "Location {} is back up (was {}); replicas return when re-announced",
                    location_uuid,
                    previous
                );
            }
        }
    }

    /// Returns true if a sweep was scheduled
    fn location_down(&mut self, event: &LocationEvent) -> bool {
        let location_uuid = event.location_uuid;
        let at = event.timestamp_millis();
        let now = timestamp_now_millis();

        let transition = self.registry.with_location(&location_uuid, |info| {
            if info.state.is_offline() {
                return None;
            }
            if at < info.last_heartbeat {
                tracing::debug!(
                    "Ignoring offline report for {} older than its last heartbeat",
                    location_uuid
                );
                return None;
            }
            info.set_state(LocationState::Down, now);
            Some(info.down_epoch)
        });

        match transition {
            None => {
                tracing::debug!("Offline report for unknown location {}", location_uuid);
                false
            }
            Some(None) => false,
            Some(Some(down_epoch)) => {
                METRICS.down_transitions.inc();
                tracing::warn!("Location {} reported offline", location_uuid);
                self.pending_sweeps.insert(
                    location_uuid,
                    PendingSweep {
                        down_epoch,
                        decommission: false,
                    },
                );
                true
            }
        }
    }

    /// One pass: liveness timeouts, owed sweeps, due retries, health gauges
    pub async fn tick(&mut self, now_ms: u64) {
        self.advance_liveness(now_ms);
        self.run_pending_sweeps().await;
        self.dispatch_retries();
        self.refresh_health();
    }

    fn advance_liveness(&mut self, now_ms: u64) {
        let heartbeat_timeout = self.config.heartbeat_timeout_ms;
        let grace_period = self.config.grace_period_ms;

        for location_uuid in self.registry.location_ids() {
            let went_down = self.registry.with_location(&location_uuid, |info| {
                let silence = now_ms.saturating_sub(info.last_heartbeat);
                match info.state {
                    LocationState::Up if silence >= heartbeat_timeout => {
                        info.set_state(LocationState::Suspect, now_ms);
                        tracing::info!("Location {} is suspect ({}ms silent)", location_uuid, silence);
                        None
                    }
                    LocationState::Suspect if silence < heartbeat_timeout => {
                        info.set_state(LocationState::Up, now_ms);
                        tracing::info!("Location {} is up again", location_uuid);
                        None
                    }
                    LocationState::Suspect if silence >= grace_period => {
                        info.set_state(LocationState::Down, now_ms);
                        Some(info.down_epoch)
                    }
                    _ => None,
                }
            });

            if let Some(Some(down_epoch)) = went_down {
                METRICS.down_transitions.inc();
                tracing::warn!("Location {} is down after the grace period", location_uuid);
                self.pending_sweeps.insert(
                    location_uuid,
                    PendingSweep {
                        down_epoch,
                        decommission: false,
                    },
                );
            }
        }
    }

    async fn run_pending_sweeps(&mut self) {
        let owed: Vec<(LocationId, PendingSweep)> =
            self.pending_sweeps.iter().map(|(l, s)| (*l, *s)).collect();
        for (location_uuid, sweep) in owed {
            if self.sweep(location_uuid, sweep).await {
                self.pending_sweeps.remove(&location_uuid);
            }
        }
    }

    /// Drop every replica announced on a location before its down
    /// transition. Master-indexed replicas go at once; returns false when the
    /// ground-derived part has to be retried on a later tick.
    async fn sweep(&mut self, location_uuid: LocationId, sweep: PendingSweep) -> bool {
        let store_on_master = self
            .directory
            .config()
            .snapshot()
            .store_sequoia_replicas_on_master;
        let before = if sweep.decommission {
            u64::MAX
        } else {
            sweep.down_epoch
        };

        let mut dropped = 0;
        for chunk_id in self.directory.location_chunks(&location_uuid) {
            if matches!(
                self.directory.drop_replica_before(chunk_id, location_uuid, before),
                DropOutcome::Dropped(_)
            ) {
                dropped += 1;
            }
        }

        // Let queued projections land so the ground lookup sees them
        match tokio::time::timeout(self.config.retry_max(), self.mirror.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Flush before sweeping {} failed: {}", location_uuid, e),
            Err(_) => tracing::warn!("Flush before sweeping {} timed out", location_uuid),
        }
        match self.ground.location_replicas(&location_uuid) {
            Ok(rows) => {
                let chunks: BTreeSet<ChunkId> = rows.into_iter().map(|row| row.chunk_id).collect();
                for chunk_id in chunks {
                    if matches!(
                        self.directory.drop_replica_before(chunk_id, location_uuid, before),
                        DropOutcome::Dropped(_)
                    ) {
                        dropped += 1;
                    }
                }
            }
            Err(e) if !store_on_master => {
                tracing::warn!(
                    "Sweep of {} postponed after dropping {} indexed replicas, ground lookup failed: {}",
                    location_uuid,
                    dropped,
                    e
                );
                return false;
            }
            Err(e) => {
                tracing::debug!("Sweeping {} from the master index only: {}", location_uuid, e);
            }
        }

        let now = timestamp_now_millis();
        if sweep.decommission {
            self.registry.remove_location(&location_uuid);
            tracing::info!(
                "Location {} decommissioned, {} replicas dropped",
                location_uuid,
                dropped
            );
            return true;
        }

        let reaped = self
            .registry
            .with_location(&location_uuid, |info| {
                let current = info.state == LocationState::Down && info.down_epoch == sweep.down_epoch;
                if current {
                    info.set_state(LocationState::Reaped, now);
                }
                current
            })
            .unwrap_or(false);
        if reaped {
            tracing::info!("Location {} reaped, {} replicas dropped", location_uuid, dropped);
        } else {
            tracing::info!(
                "Owed sweep of {} finished, {} replicas dropped",
                location_uuid,
                dropped
            );
        }
        true
    }

    pub fn handle_ack(&mut self, ack: MirrorAck) {
        match ack.outcome {
            MirrorOutcome::Applied { .. } => {
                if self.backlog.remove(&ack.chunk_id).is_some() {
                    tracing::info!(
                        "Ground projection of {} caught up after {} attempts",
                        ack.chunk_id,
                        ack.attempt + 1
                    );
                }
                self.directory.release_pending_removals(&ack.chunk_id);
                self.drop_offline_leftovers(ack.chunk_id);
            }
            MirrorOutcome::Failed(reason) => {
                let attempt = self
                    .backlog
                    .get(&ack.chunk_id)
                    .map(|e| e.attempt.max(ack.attempt))
                    .unwrap_or(ack.attempt);
                let delay = backoff_delay(attempt, self.config.retry_base(), self.config.retry_max());
                tracing::warn!(
                    "Ground projection of {} failed (attempt {}): {}; retrying in {:?}",
                    ack.chunk_id,
                    attempt + 1,
                    reason,
                    delay
                );
                self.backlog.insert(
                    ack.chunk_id,
                    BacklogEntry {
                        attempt: attempt + 1,
                        due: Some(Instant::now() + delay),
                    },
                );
            }
        }
        METRICS.reconcile_backlog.set(self.backlog.len() as u64);
    }

    /// A projection that failed before a sweep read the ground store can land
    /// after that sweep; drop replicas it left on offline locations.
    fn drop_offline_leftovers(&self, chunk_id: ChunkId) {
        let Ok(view) = self.directory.query(chunk_id) else {
            return;
        };
        for replica in view.stored_sequoia_replicas {
            let offline_epoch = self
                .registry
                .location(&replica.location_uuid)
                .filter(|info| info.state.is_offline())
                .map(|info| info.down_epoch);
            if let Some(down_epoch) = offline_epoch {
                if let DropOutcome::Dropped(_) =
                    self.directory
                        .drop_replica_before(chunk_id, replica.location_uuid, down_epoch)
                {
                    tracing::info!(
                        "Dropped leftover replica of {} on offline location {}",
                        chunk_id,
                        replica.location_uuid
                    );
                }
            }
        }
    }

    fn dispatch_retries(&mut self) {
        let now = Instant::now();
        for (chunk_id, entry) in self.backlog.iter_mut() {
            if entry.due.is_some_and(|due| due <= now) {
                entry.due = None;
                self.mirror.retry(*chunk_id, entry.attempt);
            }
        }
        METRICS.reconcile_backlog.set(self.backlog.len() as u64);
    }

    fn refresh_health(&mut self) {
        let degraded: HashSet<ChunkId> = self
            .directory
            .degraded_chunks(self.config.degraded_after())
            .into_iter()
            .collect();
        for chunk_id in degraded.difference(&self.degraded) {
            tracing::warn!("Chunk {} is degraded", chunk_id);
        }
        METRICS.degraded_chunks.set(degraded.len() as u64);
        self.degraded = degraded;

        METRICS
            .lost_chunks
            .set(self.directory.lost_chunks().len() as u64);

        let (up, suspect, down) = self.registry.state_counts();
        METRICS.locations_up.set(up);
        METRICS.locations_suspect.set(suspect);
        METRICS.locations_down.set(down);
    }
}
