//! Shared helpers for integration tests
#![allow(dead_code)]

use replicadir::common::{
    ChunkManagerConfig, Config, LocationId, MediumConfig, ReconcilerConfig,
};
use replicadir::coordinator::ground::GroundStore;
use replicadir::coordinator::{MasterState, MemGroundStore};
use replicadir::ChunkId;
use std::sync::Arc;
use std::time::Duration;

pub const SSD: &str = "ssd";
pub const HDD: &str = "hdd";

/// Poll `check` until it holds or `timeout` expires
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn sequoia_config() -> ChunkManagerConfig {
    ChunkManagerConfig {
        sequoia_chunk_replicas_percentage: 100,
        ..Default::default()
    }
}

/// Fast loop timings; heartbeats never time out unless a test asks for it
pub fn fast_reconciler() -> ReconcilerConfig {
    ReconcilerConfig {
        heartbeat_timeout_ms: 3_600_000,
        grace_period_ms: 7_200_000,
        tick_interval_ms: 20,
        retry_base_ms: 10,
        retry_max_ms: 200,
        degraded_after_ms: 60_000,
    }
}

pub fn media() -> Vec<MediumConfig> {
    vec![
        MediumConfig {
            name: SSD.into(),
            enable_sequoia_replicas: true,
        },
        MediumConfig {
            name: HDD.into(),
            enable_sequoia_replicas: false,
        },
    ]
}

pub struct TestMaster {
    pub state: MasterState,
    pub ground: Arc<MemGroundStore>,
}

impl TestMaster {
    pub fn start(chunk_manager: ChunkManagerConfig) -> Self {
        Self::start_with(chunk_manager, fast_reconciler())
    }

    pub fn start_with(chunk_manager: ChunkManagerConfig, reconciler: ReconcilerConfig) -> Self {
        let mut config = Config::default();
        config.master.media = media();
        config.chunk_manager = chunk_manager;
        config.reconciler = reconciler;

        let ground = Arc::new(MemGroundStore::new());
        let state = MasterState::start(&config, ground.clone());
        Self { state, ground }
    }

    pub fn location(&self, medium: &str) -> LocationId {
        let id = LocationId::new();
        self.state
            .registry
            .register_location(id, "node-1:9012", medium)
            .unwrap();
        id
    }

    /// Number of `chunk_replicas` rows of a chunk (0 or 1)
    pub fn chunk_rows(&self, chunk: &ChunkId) -> usize {
        self.ground
            .scan_chunk_replicas()
            .unwrap()
            .iter()
            .filter(|row| row.chunk_id == *chunk)
            .count()
    }

    /// Number of `location_replicas` rows referencing a chunk
    pub fn location_rows(&self, chunk: &ChunkId) -> usize {
        self.ground
            .scan_location_replicas()
            .unwrap()
            .iter()
            .filter(|row| row.chunk_id == *chunk)
            .count()
    }

    pub async fn flush(&self) {
        self.state.mirror.flush().await.unwrap();
    }
}
