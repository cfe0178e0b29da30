//! Hashing utilities for replicadir
//!
//! - Rollout buckets deciding which new chunks use sequoia tracking
//! - Shard selection for the directory's per-chunk ownership

use crate::common::types::ChunkId;

/// Number of rollout buckets (percent granularity)
pub const ROLLOUT_BUCKETS: u64 = 100;

fn hash_u64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(head)
}

/// Rollout bucket of a chunk in `0..100`
pub fn rollout_bucket(chunk_id: &ChunkId) -> u8 {
    (hash_u64(chunk_id.as_bytes()) % ROLLOUT_BUCKETS) as u8
}

/// Does a chunk fall inside a rollout of `percentage` percent?
pub fn in_rollout(chunk_id: &ChunkId, percentage: u8) -> bool {
    if percentage >= 100 {
        return true;
    }
    rollout_bucket(chunk_id) < percentage
}

/// Shard index for arbitrary id bytes
pub fn shard_index(bytes: &[u8], num_shards: usize) -> usize {
    debug_assert!(num_shards > 0);
    (hash_u64(bytes) % num_shards as u64) as usize
}
