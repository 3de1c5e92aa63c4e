//! Shard count resolution and shard-to-cluster partitioning.
//!
//! Everything in here is pure: the orchestrator resolves its inputs (a fixed
//! or recommended shard count, a desired cluster count) and calls into this
//! module to get the ordered list of contiguous shard ranges, one per
//! cluster.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardingError};

/// Identifier of a single shard, dense over `[0, shard_count)`.
pub type ShardId = u32;

/// Identifier of a cluster (worker process), dense over `[0, cluster_count)`.
pub type ClusterId = u32;

/// Guild density the upstream recommendation is calibrated against.
pub const DEFAULT_GUILDS_PER_SHARD: u32 = 1000;

/// Contiguous range of shard IDs owned by one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    /// Start shard ID (inclusive).
    pub start_shard: ShardId,
    /// End shard ID (exclusive).
    pub end_shard: ShardId,
}

impl ShardRange {
    /// Create a new shard range.
    pub fn new(start: ShardId, end: ShardId) -> Self {
        Self {
            start_shard: start,
            end_shard: end,
        }
    }

    /// Get the number of shards in this range.
    pub fn count(&self) -> u32 {
        self.end_shard.saturating_sub(self.start_shard)
    }

    /// Check if a shard ID is in this range.
    pub fn contains(&self, shard_id: ShardId) -> bool {
        shard_id >= self.start_shard && shard_id < self.end_shard
    }

    /// Iterate over shard IDs in this range.
    pub fn iter(&self) -> impl Iterator<Item = ShardId> {
        self.start_shard..self.end_shard
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count() {
            0 => write!(f, "[]"),
            1 => write!(f, "[{}]", self.start_shard),
            _ => write!(f, "[{}..={}]", self.start_shard, self.end_shard - 1),
        }
    }
}

/// Resolved shard count together with the per-cluster assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    /// Total number of shards.
    pub shard_count: u32,
    /// One range per cluster, indexed by `ClusterId`.
    pub ranges: Vec<ShardRange>,
}

impl ShardLayout {
    /// Partition `shard_count` shards over at most `cluster_count` clusters.
    pub fn new(shard_count: u32, cluster_count: u32) -> Result<Self> {
        let ranges = partition(shard_count, cluster_count)?;
        Ok(Self { shard_count, ranges })
    }

    /// Number of clusters that will actually be spawned.
    pub fn cluster_count(&self) -> u32 {
        self.ranges.len() as u32
    }

    /// Range assigned to a cluster.
    pub fn range(&self, cluster_id: ClusterId) -> Option<ShardRange> {
        self.ranges.get(cluster_id as usize).copied()
    }

    /// Find the cluster hosting a shard.
    pub fn cluster_for_shard(&self, shard_id: ShardId) -> Option<ClusterId> {
        self.ranges
            .iter()
            .position(|r| r.contains(shard_id))
            .map(|idx| idx as ClusterId)
    }

    /// Iterate `(cluster_id, range)` pairs in ascending cluster order.
    pub fn iter(&self) -> impl Iterator<Item = (ClusterId, ShardRange)> + '_ {
        self.ranges
            .iter()
            .enumerate()
            .map(|(idx, range)| (idx as ClusterId, *range))
    }
}

/// Scale an upstream shard recommendation to a guild density target.
///
/// Computes `ceil(recommended * 1000 / guilds_per_shard)`. A density of 1000
/// leaves the recommendation unchanged; lower densities over-shard.
pub fn calc_shards(recommended: u32, guilds_per_shard: u32) -> u32 {
    if guilds_per_shard == 0 {
        return recommended;
    }
    let scaled = recommended as u64 * DEFAULT_GUILDS_PER_SHARD as u64;
    let gps = guilds_per_shard as u64;
    let shards = (scaled + gps - 1) / gps;
    shards.min(u32::MAX as u64) as u32
}

/// Never run more clusters than shards.
pub fn effective_cluster_count(shard_count: u32, cluster_count: u32) -> u32 {
    cluster_count.min(shard_count)
}

/// `shard_count / cluster_count`, rounded half away from zero.
pub fn shards_per_cluster(shard_count: u32, cluster_count: u32) -> u32 {
    if cluster_count == 0 {
        return 0;
    }
    let s = shard_count as u64;
    let c = cluster_count as u64;
    ((2 * s + c) / (2 * c)) as u32
}

/// Split `[0, shard_count)` into contiguous per-cluster ranges.
///
/// The range size is `shards_per_cluster(shard_count, clusters)` where
/// `clusters` is clamped to the shard count. If chunking produces more
/// groups than clusters, every surplus group is merged into the last
/// cluster. If it produces fewer, one cluster per group is returned. The
/// result always covers every shard exactly once and never contains an
/// empty range.
pub fn partition(shard_count: u32, cluster_count: u32) -> Result<Vec<ShardRange>> {
    if shard_count == 0 {
        return Err(ShardingError::config("shard count must be at least 1"));
    }
    if cluster_count == 0 {
        return Err(ShardingError::config("cluster count must be at least 1"));
    }

    let clusters = effective_cluster_count(shard_count, cluster_count);
    let per_cluster = shards_per_cluster(shard_count, clusters).max(1);

    let mut ranges = Vec::with_capacity(clusters as usize);
    let mut start = 0u32;
    while start < shard_count {
        let end = start.saturating_add(per_cluster).min(shard_count);
        ranges.push(ShardRange::new(start, end));
        start = end;
    }

    if ranges.len() > clusters as usize {
        // Fold the overflow groups into the last kept cluster
        let last = clusters as usize - 1;
        let start = ranges[last].start_shard;
        ranges.truncate(last);
        ranges.push(ShardRange::new(start, shard_count));
    }

    Ok(ranges)
}
