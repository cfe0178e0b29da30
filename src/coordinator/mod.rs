//! Master-side replica bookkeeping
//!
//! The master is responsible for:
//! - The authoritative replica directory (chunk → locations)
//! - Location liveness and medium policy
//! - Projecting sequoia-tracked replicas into the ground store
//! - Reconciliation after location failures

pub mod directory;
pub mod dynconfig;
pub mod ground;
pub mod http;
pub mod mirror;
pub mod reconciler;
pub mod registry;
pub mod server;

pub use directory::{ChunkView, DropOutcome, RecordOutcome, ReplicaDirectory, ReplicationStatus};
pub use ground::{open_ground, GroundStore, MemGroundStore, RocksGroundStore};
pub use reconciler::{LivenessStatus, LocationEvent};
pub use server::{Master, MasterState};
