//! Configuration for replicadir components
//!
//! Loaded from an optional TOML file layered with `REPLICADIR__*` environment
//! variables. The `chunk_manager` section is the dynamic part: the master keeps
//! it as an immutable snapshot that the admin API can replace at runtime.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "replicadir.toml";
const ENV_PREFIX: &str = "REPLICADIR";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub master: MasterConfig,

    #[serde(default)]
    pub chunk_manager: ChunkManagerConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "master-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            master: MasterConfig::default(),
            chunk_manager: ChunkManagerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `replicadir.toml` if present) and the
    /// environment. Missing files are not an error.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf()).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let loaded: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.chunk_manager.validate()?;
        self.reconciler.validate()?;
        let mut seen = std::collections::HashSet::new();
        for medium in &self.master.media {
            if medium.name.is_empty() {
                return Err(crate::Error::InvalidConfig("medium name cannot be empty".into()));
            }
            if !seen.insert(medium.name.as_str()) {
                return Err(crate::Error::InvalidConfig(format!(
                    "medium {} declared twice",
                    medium.name
                )));
            }
        }
        Ok(())
    }
}

/// Master (coordinator) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    #[serde(default)]
    pub ground: GroundConfig,

    /// Media known at startup
    #[serde(default = "default_media")]
    pub media: Vec<MediumConfig>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}

fn default_media() -> Vec<MediumConfig> {
    vec![MediumConfig {
        name: crate::common::DEFAULT_MEDIUM.to_string(),
        enable_sequoia_replicas: false,
    }]
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            ground: GroundConfig::default(),
            media: default_media(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroundBackend {
    Rocksdb,
    Memory,
}

/// Ground store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundConfig {
    #[serde(default = "default_ground_backend")]
    pub backend: GroundBackend,

    /// RocksDB directory (ignored by the memory backend)
    #[serde(default = "default_ground_path")]
    pub path: PathBuf,
}

fn default_ground_backend() -> GroundBackend {
    GroundBackend::Rocksdb
}

fn default_ground_path() -> PathBuf {
    PathBuf::from("./ground-data")
}

impl Default for GroundConfig {
    fn default() -> Self {
        Self {
            backend: default_ground_backend(),
            path: default_ground_path(),
        }
    }
}

/// Medium declared in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumConfig {
    pub name: String,
    #[serde(default)]
    pub enable_sequoia_replicas: bool,
}

/// Dynamic chunk manager toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManagerConfig {
    /// Share (0..=100) of newly created chunks that use sequoia tracking
    #[serde(default)]
    pub sequoia_chunk_replicas_percentage: u8,

    /// Serve sequoia replica reads from the ground store
    #[serde(default)]
    pub fetch_replicas_from_sequoia: bool,

    /// Keep sequoia replicas in the master's per-location index as well
    #[serde(default = "default_true")]
    pub store_sequoia_replicas_on_master: bool,

    /// Apply sequoia replica removals to the master's index immediately
    /// instead of waiting for the ground deletion to be acknowledged
    #[serde(default = "default_true")]
    pub processed_removed_sequoia_replicas_on_master: bool,

    #[serde(default = "default_max_replication_factor")]
    pub max_replication_factor: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_replication_factor() -> u32 {
    20
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        Self {
            sequoia_chunk_replicas_percentage: 0,
            fetch_replicas_from_sequoia: false,
            store_sequoia_replicas_on_master: true,
            processed_removed_sequoia_replicas_on_master: true,
            max_replication_factor: default_max_replication_factor(),
        }
    }
}

impl ChunkManagerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.sequoia_chunk_replicas_percentage > 100 {
            return Err(crate::Error::InvalidConfig(format!(
                "sequoia_chunk_replicas_percentage must be <= 100, got {}",
                self.sequoia_chunk_replicas_percentage
            )));
        }
        if self.max_replication_factor == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_replication_factor must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Reconciliation loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Silence after which an up location becomes suspect
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Silence after which a suspect location is declared down
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    /// How long a chunk may stay underreplicated before it is reported
    #[serde(default = "default_degraded_after")]
    pub degraded_after_ms: u64,
}

fn default_heartbeat_timeout() -> u64 {
    5_000
}
fn default_grace_period() -> u64 {
    30_000
}
fn default_tick_interval() -> u64 {
    1_000
}
fn default_retry_base() -> u64 {
    100
}
fn default_retry_max() -> u64 {
    10_000
}
fn default_degraded_after() -> u64 {
    60_000
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            grace_period_ms: default_grace_period(),
            tick_interval_ms: default_tick_interval(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
            degraded_after_ms: default_degraded_after(),
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.grace_period_ms < self.heartbeat_timeout_ms {
            return Err(crate::Error::InvalidConfig(
                "grace_period_ms must not be shorter than heartbeat_timeout_ms".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig("tick_interval_ms must be positive".into()));
        }
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            return Err(crate::Error::InvalidConfig(
                "retry_base_ms must be positive and not exceed retry_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn degraded_after(&self) -> Duration {
        Duration::from_millis(self.degraded_after_ms)
    }
}
