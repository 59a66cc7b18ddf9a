//! Processing stage selection.
//!
//! When a query reaches a single target the shard can finish it. With more
//! than one target each shard stops at mergeable partial state and the
//! initiator merges. Finishing on several shards and merging again would
//! aggregate twice.

use std::fmt;

use crate::cluster::Cluster;

/// How far a shard processes a query before returning rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingStage {
    /// Partially aggregated state that the initiator merges.
    WithMergeableState,
    /// Final result.
    Complete,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WithMergeableState => write!(f, "WithMergeableState"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

/// Number of streams a query fans out to.
#[must_use]
pub fn effective_targets(cluster: &Cluster, max_parallel_replicas: u32) -> u64 {
    u64::from(cluster.remote_shard_count()) * u64::from(max_parallel_replicas)
        + u64::from(cluster.local_shard_count())
}

/// Chooses the stage every shard must reach.
#[must_use]
pub fn processing_stage(
    cluster: &Cluster,
    max_parallel_replicas: u32,
    group_by_no_merge: bool,
) -> ProcessingStage {
    if group_by_no_merge || effective_targets(cluster, max_parallel_replicas) == 1 {
        ProcessingStage::Complete
    } else {
        ProcessingStage::WithMergeableState
    }
}
