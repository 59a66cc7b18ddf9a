//! Block streams.

use std::pin::Pin;

use fathom_core::Block;
use futures::{Stream, StreamExt};

use crate::error::DistResult;

/// Stream of result blocks from one shard, or from the merge of many.
pub type BlockStream = Pin<Box<dyn Stream<Item = DistResult<Block>> + Send>>;

/// Stream over already materialized blocks.
#[must_use]
pub fn block_stream(blocks: Vec<Block>) -> BlockStream {
    Box::pin(futures::stream::iter(blocks.into_iter().map(Ok)))
}

/// Drains a stream, stopping at the first error.
///
/// # Errors
/// Returns the first error the stream yields.
pub async fn collect_blocks(mut stream: BlockStream) -> DistResult<Vec<Block>> {
    let mut blocks = Vec::new();
    while let Some(block) = stream.next().await {
        blocks.push(block?);
    }
    Ok(blocks)
}
