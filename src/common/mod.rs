//! Common utilities and types shared across replicadir

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod tracing_middleware;
pub mod types;
pub mod utils;

pub use config::{
    ChunkManagerConfig, Config, GroundBackend, GroundConfig, MasterConfig, MediumConfig,
    ReconcilerConfig,
};
pub use error::{Error, Result};
pub use hash::{in_rollout, rollout_bucket, shard_index};
pub use metrics::METRICS;
pub use types::{ChunkId, LocationId, ReplicaTracking, StoredReplica};
pub use utils::{backoff_delay, parse_duration, retry_with_backoff, timestamp_now_millis, LocationState};

/// Medium every location falls back to when nothing else is assigned
pub const DEFAULT_MEDIUM: &str = "default";
