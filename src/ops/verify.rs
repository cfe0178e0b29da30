//! Verify the ground store against the directory
//!
//! Every chunk's ground rows are compared with what the recompute rule says
//! they should be. The comparison is a snapshot: projections still queued in
//! the mirror show up as missing or divergent until they land.

use crate::common::{ChunkId, LocationId, Result};
use crate::coordinator::directory::ReplicaDirectory;
use crate::coordinator::ground::GroundStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub total_chunks: usize,
    pub sequoia_chunks: usize,
    pub consistent: usize,
    /// Chunks with sequoia replicas but no `chunk_replicas` row
    pub missing_rows: Vec<ChunkId>,
    /// Chunks whose rows disagree with their projection
    pub divergent: Vec<ChunkId>,
    /// `chunk_replicas` rows that should not exist
    pub orphaned_chunk_rows: Vec<ChunkId>,
    /// `location_replicas` rows no projection accounts for
    pub orphaned_location_rows: Vec<(LocationId, ChunkId)>,
    pub lost: usize,
    pub underreplicated: usize,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_rows.is_empty()
            && self.divergent.is_empty()
            && self.orphaned_chunk_rows.is_empty()
            && self.orphaned_location_rows.is_empty()
    }
}

pub fn verify_ground(directory: &ReplicaDirectory, ground: &dyn GroundStore) -> Result<VerifyReport> {
    tracing::info!("Starting ground verification");

    let chunk_rows: HashMap<ChunkId, _> = ground
        .scan_chunk_replicas()?
        .into_iter()
        .map(|row| (row.chunk_id, row))
        .collect();
    let mut location_rows: HashMap<ChunkId, BTreeSet<LocationId>> = HashMap::new();
    for row in ground.scan_location_replicas()? {
        location_rows
            .entry(row.chunk_id)
            .or_default()
            .insert(row.location_uuid);
    }

    let mut report = VerifyReport::default();

    for chunk_id in directory.chunk_ids() {
        let Ok(view) = directory.query(chunk_id) else {
            // Removed while we were scanning
            continue;
        };
        report.total_chunks += 1;
        if view.sequoia {
            report.sequoia_chunks += 1;
        }
        if view.status.lost {
            report.lost += 1;
        }
        if view.status.underreplicated {
            report.underreplicated += 1;
        }

        let projection = directory.ground_projection(&chunk_id);
        let expected_locations: BTreeSet<LocationId> = projection
            .as_ref()
            .map(|p| p.replicas.iter().map(|r| r.location_uuid).collect())
            .unwrap_or_default();
        let actual_locations = location_rows.get(&chunk_id).cloned().unwrap_or_default();

        match (&projection, chunk_rows.get(&chunk_id)) {
            (None, None) if actual_locations.is_empty() => report.consistent += 1,
            (Some(_), None) => report.missing_rows.push(chunk_id),
            (Some(p), Some(row)) if p == row && expected_locations == actual_locations => {
                report.consistent += 1
            }
            _ => report.divergent.push(chunk_id),
        }
    }

    for (chunk_id, row) in &chunk_rows {
        if directory.ground_projection(chunk_id).is_none() && !directory.contains(chunk_id) {
            tracing::debug!("Orphaned chunk row {} ({} replicas)", chunk_id, row.replicas.len());
            report.orphaned_chunk_rows.push(*chunk_id);
        }
    }
    for (chunk_id, locations) in &location_rows {
        let expected: BTreeSet<LocationId> = directory
            .ground_projection(chunk_id)
            .map(|p| p.replicas.iter().map(|r| r.location_uuid).collect())
            .unwrap_or_default();
        for location in locations.difference(&expected) {
            report.orphaned_location_rows.push((*location, *chunk_id));
        }
    }
    report.orphaned_chunk_rows.sort();
    report.orphaned_location_rows.sort();

    tracing::info!(
        "Ground verification done: {} chunks, {} consistent, {} missing, {} divergent, {} orphaned rows",
        report.total_chunks,
        report.consistent,
        report.missing_rows.len(),
        report.divergent.len(),
        report.orphaned_chunk_rows.len() + report.orphaned_location_rows.len()
    );
    Ok(report)
}
