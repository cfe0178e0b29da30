//! Ground verification and repair

mod common;

use common::{sequoia_config, TestMaster, SSD};
use replicadir::common::{LocationId, StoredReplica};
use replicadir::coordinator::ground::{ChunkReplicasRow, GroundStore, GroundWrite, LocationReplicaRow};
use replicadir::ops::{repair_ground, verify_ground};
use replicadir::ChunkId;

#[tokio::test]
async fn test_verify_clean_ground() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;
    for _ in 0..5 {
        let chunk = ChunkId::new();
        directory.create_chunk(chunk, 2).unwrap();
        directory.record_replica(chunk, master.location(SSD));
    }
    master.flush().await;

    let report = verify_ground(directory, master.ground.as_ref()).unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.total_chunks, 5);
    assert_eq!(report.sequoia_chunks, 5);
    assert_eq!(report.consistent, 5);
    assert_eq!(report.underreplicated, 5);
}

#[tokio::test]
async fn test_repair_fixes_tampered_rows() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;

    let healthy = ChunkId::new();
    let tampered = ChunkId::new();
    let loc = master.location(SSD);
    for chunk in [healthy, tampered] {
        directory.create_chunk(chunk, 1).unwrap();
        directory.record_replica(chunk, loc);
    }
    master.flush().await;

    // Rows nobody accounts for, plus a damaged row of a live chunk
    let ghost = ChunkId::new();
    let stray = LocationId::new();
    master
        .ground
        .apply(&[
            GroundWrite::PutChunk(ChunkReplicasRow {
                chunk_id: ghost,
                replicas: vec![StoredReplica::new(stray, SSD)],
                last_seen_replicas: vec![],
            }),
            GroundWrite::PutLocation(LocationReplicaRow {
                location_uuid: stray,
                chunk_id: ghost,
                medium: SSD.into(),
            }),
            GroundWrite::PutLocation(LocationReplicaRow {
                location_uuid: stray,
                chunk_id: healthy,
                medium: SSD.into(),
            }),
            GroundWrite::DeleteChunk(tampered),
        ])
        .unwrap();

    let report = verify_ground(directory, master.ground.as_ref()).unwrap();
    assert!(!report.is_consistent());
    assert_eq!(report.missing_rows, vec![tampered]);
    assert_eq!(report.divergent, vec![healthy]);
    assert_eq!(report.orphaned_chunk_rows, vec![ghost]);
    assert_eq!(report.orphaned_location_rows.len(), 2);

    let dry = repair_ground(directory, master.ground.as_ref(), &master.state.mirror, true)
        .await
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.chunks_resynced, 3);
    assert!(!verify_ground(directory, master.ground.as_ref())
        .unwrap()
        .is_consistent());

    let repaired = repair_ground(directory, master.ground.as_ref(), &master.state.mirror, false)
        .await
        .unwrap();
    assert_eq!(repaired.chunks_resynced, 3);
    assert_eq!(repaired.location_rows_deleted, 2);

    let after = verify_ground(directory, master.ground.as_ref()).unwrap();
    assert!(after.is_consistent(), "{:?}", after);
    assert_eq!(master.chunk_rows(&tampered), 1);
    assert_eq!(master.chunk_rows(&ghost), 0);
    assert!(master.ground.location_replicas(&stray).unwrap().is_empty());
}
