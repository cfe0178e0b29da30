//! Repair the ground store
//!
//! Re-projects every chunk verification flagged and deletes rows nothing
//! accounts for. All writes go through the ground mirror.

use crate::common::Result;
use crate::coordinator::directory::ReplicaDirectory;
use crate::coordinator::ground::GroundStore;
use crate::coordinator::mirror::MirrorHandle;
use crate::ops::verify::{verify_ground, VerifyReport};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairReport {
    pub chunks_checked: usize,
    pub chunks_resynced: usize,
    pub location_rows_deleted: usize,
    pub dry_run: bool,
}

pub async fn repair_ground(
    directory: &ReplicaDirectory,
    ground: &dyn GroundStore,
    mirror: &MirrorHandle,
    dry_run: bool,
) -> Result<RepairReport> {
    tracing::info!("Starting ground repair (dry_run={})", dry_run);

    let VerifyReport {
        total_chunks,
        missing_rows,
        divergent,
        orphaned_chunk_rows,
        orphaned_location_rows,
        ..
    } = verify_ground(directory, ground)?;

    let mut report = RepairReport {
        chunks_checked: total_chunks,
        dry_run,
        ..Default::default()
    };

    let resync: Vec<_> = missing_rows
        .into_iter()
        .chain(divergent)
        .chain(orphaned_chunk_rows)
        .collect();
    report.chunks_resynced = resync.len();
    report.location_rows_deleted = orphaned_location_rows.len();

    if dry_run {
        return Ok(report);
    }

    for chunk_id in resync {
        mirror.resync(chunk_id);
    }
    mirror.delete_location_rows(orphaned_location_rows);
    mirror.flush().await?;

    tracing::info!(
        "Ground repair done: {} chunks re-projected, {} location rows deleted",
        report.chunks_resynced,
        report.location_rows_deleted
    );
    Ok(report)
}
