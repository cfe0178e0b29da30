//! # replicadir
//!
//! A chunk replica directory: for every chunk of a distributed store it
//! tracks which storage locations hold a copy. Replicas on media with
//! sequoia tracking enabled are additionally projected into an external
//! ground store, kept consistent with the master's authoritative state.
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!  placement / liveness events
//!             │ HTTP
//! ┌───────────▼─────────────────────────────┐
//! │                 Master                  │
//! │  Replica directory (sharded, in memory) │
//! │  Location registry + medium policy      │
//! │  Reconciliation loop                    │
//! └───────────┬─────────────────────────────┘
//!             │ projection batches (one writer)
//! ┌───────────▼─────────────────────────────┐
//! │ Ground store                            │
//! │  chunk_replicas / location_replicas     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! replicadir-master serve \
//!   --bind 0.0.0.0:7000 \
//!   --ground-path ./ground-data \
//!   --grace-period 30s
//! ```
//!
//! ### Inspect
//! ```bash
//! replicadir chunk <chunk-id>
//! replicadir stored-replicas <chunk-id> --view sequoia
//! replicadir ground chunk-replicas
//! replicadir verify
//! replicadir repair --dry-run
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{ChunkId, Config, Error, LocationId, Result, StoredReplica};
pub use coordinator::{Master, ReplicaDirectory};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
