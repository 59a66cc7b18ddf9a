//! Fathom Routing - cluster topology and shard selection.
//!
//! This crate describes the shards a distributed table spans, compiles the
//! sharding expression that assigns rows to shards, and decides how much
//! query processing each shard has to perform.
//!
//! # Design (`TigerStyle`)
//!
//! - **Immutable topology**: A cluster is validated once and never mutated
//! - **Weighted slots**: `key mod total_weight` picks a slot, slots map to shards
//! - **Explicit limits**: Shard counts, slot counts and expression sizes are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cluster;
mod error;
mod expr;
mod router;
mod stage;

pub use cluster::{Cluster, Clusters, Endpoint, Shard, ShardConfig};
pub use error::{RoutingError, RoutingResult};
pub use expr::{compile, Expression, ShardingExpression};
pub use router::{shard_keys, split_block, RoutedBlock};
pub use stage::{effective_targets, processing_stage, ProcessingStage};

/// Routing limits.
pub mod limits {
    /// Maximum number of shards in one cluster.
    pub const SHARDS_COUNT_MAX: usize = 1024;

    /// Maximum sum of shard weights (number of routing slots).
    pub const SLOTS_COUNT_MAX: u64 = 1 << 16;

    /// Maximum length of a sharding expression.
    pub const EXPRESSION_LENGTH_MAX: usize = 4096;

    /// Maximum nesting depth of a sharding expression.
    pub const EXPRESSION_DEPTH_MAX: u32 = 64;
}
