//! Replica directory behaviour against a live ground mirror

mod common;

use common::{sequoia_config, wait_until, TestMaster, HDD, SSD};
use replicadir::common::{ChunkManagerConfig, ReplicaTracking};
use replicadir::coordinator::ground::GroundStore;
use replicadir::coordinator::RecordOutcome;
use replicadir::ChunkId;
use std::collections::BTreeSet;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_rf3_chunk_projects_one_row_and_three_location_rows() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;
    let chunk = ChunkId::new();
    let locations: Vec<_> = (0..3).map(|_| master.location(SSD)).collect();

    directory.create_chunk(chunk, 3).unwrap();
    for loc in &locations {
        assert_eq!(
            directory.record_replica(chunk, *loc),
            RecordOutcome::Added(ReplicaTracking::Sequoia)
        );
    }
    // Second announcement of every replica changes nothing
    for loc in &locations {
        assert_eq!(
            directory.record_replica(chunk, *loc),
            RecordOutcome::AlreadyPresent(ReplicaTracking::Sequoia)
        );
    }

    assert_eq!(directory.stored_replicas(chunk).unwrap().len(), 3);
    assert!(wait_until(WAIT, || master.chunk_rows(&chunk) == 1).await);
    assert!(wait_until(WAIT, || master.location_rows(&chunk) == 3).await);

    let row = master.ground.get_chunk_replicas(&chunk).unwrap().unwrap();
    let in_row: BTreeSet<_> = row.replicas.iter().map(|r| r.location_uuid).collect();
    let expected: BTreeSet<_> = locations.iter().copied().collect();
    assert_eq!(in_row, expected);
    assert!(row.replicas.iter().all(|r| r.medium == SSD));
}

#[tokio::test]
async fn test_replication_factor_increase() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;
    let chunk = ChunkId::new();

    directory.create_chunk(chunk, 2).unwrap();
    directory.record_replica(chunk, master.location(SSD));
    directory.record_replica(chunk, master.location(SSD));
    assert!(!directory.query(chunk).unwrap().status.underreplicated);

    directory.set_replication_factor(chunk, 3).unwrap();
    let view = directory.query(chunk).unwrap();
    assert_eq!(view.replication_factor, 3);
    assert!(view.status.underreplicated);

    // Placement catches up asynchronously
    directory.record_replica(chunk, master.location(SSD));
    assert_eq!(directory.stored_replicas(chunk).unwrap().len(), 3);

    assert!(
        wait_until(WAIT, || {
            master
                .ground
                .get_chunk_replicas(&chunk)
                .ok()
                .flatten()
                .is_some_and(|row| row.replicas.len() == 3)
        })
        .await
    );
    assert_eq!(master.chunk_rows(&chunk), 1);
    assert!(wait_until(WAIT, || master.location_rows(&chunk) == 3).await);
}

#[tokio::test]
async fn test_mixed_media() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;
    let chunk = ChunkId::new();
    let ssd = master.location(SSD);
    let hdd = master.location(HDD);

    directory.create_chunk(chunk, 2).unwrap();
    directory.record_replica(chunk, ssd);
    directory.record_replica(chunk, hdd);

    let stored = directory.stored_replicas(chunk).unwrap();
    let sequoia = directory.stored_sequoia_replicas(chunk).unwrap();
    let master_tracked = directory.stored_master_replicas(chunk).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(sequoia.len(), 1);
    assert_eq!(master_tracked.len(), 1);
    assert_eq!(sequoia[0].location_uuid, ssd);
    assert_eq!(sequoia[0].medium, SSD);
    assert_eq!(master_tracked[0].location_uuid, hdd);
    assert_eq!(master_tracked[0].medium, HDD);

    master.flush().await;
    assert_eq!(master.chunk_rows(&chunk), 1);
    assert_eq!(master.location_rows(&chunk), 1);
    let rows = master.ground.location_replicas(&ssd).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(master.ground.location_replicas(&hdd).unwrap().is_empty());
}

#[tokio::test]
async fn test_medium_override_applies_to_new_replicas_only() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;
    let loc = master.location(HDD);
    let before = ChunkId::new();
    let after = ChunkId::new();

    directory.create_chunk(before, 1).unwrap();
    directory.create_chunk(after, 1).unwrap();
    directory.record_replica(before, loc);

    master
        .state
        .registry
        .set_medium_override(&loc, Some(SSD))
        .unwrap();
    directory.record_replica(before, loc);
    directory.record_replica(after, loc);

    assert_eq!(directory.stored_master_replicas(before).unwrap().len(), 1);
    assert_eq!(directory.stored_sequoia_replicas(after).unwrap().len(), 1);
    master.flush().await;
    assert_eq!(master.chunk_rows(&before), 0);
    assert_eq!(master.chunk_rows(&after), 1);
}

#[tokio::test]
async fn test_last_seen_survives_drops() {
    let master = TestMaster::start(sequoia_config());
    let directory = &master.state.directory;
    let chunk = ChunkId::new();
    let locations: Vec<_> = (0..3).map(|_| master.location(SSD)).collect();

    directory.create_chunk(chunk, 3).unwrap();
    let mut seen = 0;
    for loc in &locations {
        directory.record_replica(chunk, *loc);
        let now = directory.last_seen_replicas(chunk).unwrap().len();
        assert!(now >= seen);
        seen = now;
    }
    for loc in &locations {
        directory.drop_replica(chunk, *loc);
        assert_eq!(directory.last_seen_replicas(chunk).unwrap().len(), 3);
    }
    assert!(directory.stored_replicas(chunk).unwrap().is_empty());
    assert!(directory.query(chunk).unwrap().status.lost);
    assert!(directory.lost_chunks().contains(&chunk));

    master.flush().await;
    assert_eq!(master.chunk_rows(&chunk), 0);
    assert_eq!(master.location_rows(&chunk), 0);

    assert!(directory.remove_chunk(chunk));
    assert!(directory.last_seen_replicas(chunk).is_err());
}

#[tokio::test]
async fn test_fetch_replicas_from_sequoia() {
    let master = TestMaster::start(ChunkManagerConfig {
        sequoia_chunk_replicas_percentage: 100,
        fetch_replicas_from_sequoia: true,
        ..Default::default()
    });
    let directory = &master.state.directory;
    let chunk = ChunkId::new();
    let ssd = master.location(SSD);
    let hdd = master.location(HDD);

    directory.create_chunk(chunk, 2).unwrap();
    directory.record_replica(chunk, ssd);
    directory.record_replica(chunk, hdd);
    master.flush().await;

    let views = directory.replica_views(chunk).unwrap();
    assert_eq!(views.stored_sequoia_replicas.len(), 1);
    assert_eq!(views.stored_sequoia_replicas[0].location_uuid, ssd);
    assert_eq!(views.stored_replicas.len(), 2);

    // Unreadable ground store falls back to the master's own state
    master.ground.set_available(false);
    let fallback = directory.replica_views(chunk).unwrap();
    assert_eq!(fallback, views);
    master.ground.set_available(true);
}

#[tokio::test]
async fn test_rollout_percentage_zero_keeps_everything_on_master() {
    let master = TestMaster::start(ChunkManagerConfig::default());
    let directory = &master.state.directory;
    let chunks: Vec<_> = (0..20).map(|_| ChunkId::new()).collect();
    let ssd = master.location(SSD);

    for chunk in &chunks {
        directory.create_chunk(*chunk, 1).unwrap();
        assert_eq!(
            directory.record_replica(*chunk, ssd),
            RecordOutcome::Added(ReplicaTracking::Master)
        );
    }
    master.flush().await;
    assert!(master.ground.scan_chunk_replicas().unwrap().is_empty());
    assert!(master.ground.scan_location_replicas().unwrap().is_empty());
}

#[tokio::test]
async fn test_partition_invariant_under_concurrency() {
    let master = TestMaster::start(ChunkManagerConfig {
        sequoia_chunk_replicas_percentage: 50,
        ..Default::default()
    });
    let directory = master.state.directory.clone();
    let locations: Vec<_> = (0..6)
        .map(|i| master.location(if i % 2 == 0 { SSD } else { HDD }))
        .collect();
    let chunks: Vec<_> = (0..50).map(|_| ChunkId::new()).collect();
    for chunk in &chunks {
        directory.create_chunk(*chunk, 3).unwrap();
    }

    let mut tasks = Vec::new();
    for loc in locations.clone() {
        let directory = directory.clone();
        let chunks = chunks.clone();
        tasks.push(tokio::spawn(async move {
            for chunk in &chunks {
                directory.record_replica(*chunk, loc);
            }
            for chunk in chunks.iter().step_by(3) {
                directory.drop_replica(*chunk, loc);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for chunk in &chunks {
        let view = directory.query(*chunk).unwrap();
        let sequoia: BTreeSet<_> = view
            .stored_sequoia_replicas
            .iter()
            .map(|r| r.location_uuid)
            .collect();
        let master_tracked: BTreeSet<_> = view
            .stored_master_replicas
            .iter()
            .map(|r| r.location_uuid)
            .collect();
        let stored: BTreeSet<_> = view.stored_replicas.iter().map(|r| r.location_uuid).collect();
        assert!(sequoia.is_disjoint(&master_tracked));
        assert_eq!(
            stored,
            sequoia.union(&master_tracked).copied().collect::<BTreeSet<_>>()
        );
    }

    master.flush().await;
    for chunk in &chunks {
        let sequoia = directory.stored_sequoia_replicas(*chunk).unwrap().len();
        assert_eq!(master.location_rows(chunk), sequoia);
        assert_eq!(master.chunk_rows(chunk), usize::from(sequoia > 0));
    }
}
