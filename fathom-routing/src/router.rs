//! Splitting inserted blocks by destination shard.

use fathom_core::{Block, Row, Value};
use tracing::trace;

use crate::cluster::Cluster;
use crate::error::{RoutingError, RoutingResult};
use crate::expr::ShardingExpression;

/// Rows of one insert destined for one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedBlock {
    /// Position of the destination shard in the cluster.
    pub shard_index: usize,
    /// Rows for that shard, in insertion order.
    pub block: Block,
}

/// Evaluates the sharding expression and converts results to keys.
///
/// Signed results are reinterpreted as unsigned, so `-1` maps to
/// `u64::MAX`.
///
/// # Errors
/// Returns an error if evaluation fails or a result is not an integer.
pub fn shard_keys(expr: &dyn ShardingExpression, block: &Block) -> RoutingResult<Vec<u64>> {
    expr.evaluate(block)?
        .into_iter()
        .map(|value| match value {
            Value::UInt(v) => Ok(v),
            #[allow(clippy::cast_sign_loss)]
            Value::Int(v) => Ok(v as u64),
            other => Err(RoutingError::Evaluation {
                expr: expr.column_name().to_string(),
                reason: format!("sharding key must be an integer, got {}", other.type_name()),
            }),
        })
        .collect()
}

/// Splits a block into per-shard blocks.
///
/// Every row lands in exactly one returned block. Shards that receive no
/// rows are omitted; the rest are returned in shard order.
///
/// # Errors
/// Returns an error if the sharding key cannot be computed for any row;
/// in that case nothing is routed.
pub fn split_block(
    cluster: &Cluster,
    expr: &dyn ShardingExpression,
    block: &Block,
) -> RoutingResult<Vec<RoutedBlock>> {
    let keys = shard_keys(expr, block)?;
    let mut per_shard: Vec<Vec<Row>> = vec![Vec::new(); cluster.shards().len()];
    for (row, key) in block.rows().iter().zip(keys) {
        per_shard[cluster.shard_index_for_key(key)].push(row.clone());
    }

    let routed: Vec<RoutedBlock> = per_shard
        .into_iter()
        .enumerate()
        .filter(|(_, rows)| !rows.is_empty())
        .map(|(shard_index, rows)| RoutedBlock {
            shard_index,
            // Same columns as the input, so the width check cannot fail.
            block: Block::new(block.columns().to_vec(), rows).unwrap_or_default(),
        })
        .collect();

    // TigerStyle: Assert postconditions.
    debug_assert_eq!(
        routed.iter().map(|r| r.block.num_rows()).sum::<usize>(),
        block.num_rows()
    );
    trace!(rows = block.num_rows(), shards = routed.len(), "split block by sharding key");
    Ok(routed)
}
