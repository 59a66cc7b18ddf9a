//! Fathom Core - values, blocks and the query model shared by every Fathom crate.
//!
//! This crate holds the pieces that the distributed table layer passes
//! between shards: typed values, column-ordered blocks with a compact binary
//! encoding, table schemas and an immutable query representation whose
//! per-shard rewrites are pure functions.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Immutable queries**: Rewriting a query produces a new value, never mutates a shared one
//! - **Explicit limits**: Bounded column counts, row counts and string sizes
//! - **Typed errors**: Every failure is a `CoreError` variant
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod aggregate;
mod block;
mod error;
pub mod limits;
mod query;
mod schema;
mod types;
mod value;

pub use aggregate::{aggregate_block, merge_partial_blocks};
pub use block::Block;
pub use error::{CoreError, CoreResult};
pub use query::{
    Aggregate, AggregateFunction, AlterCommand, AlterQuery, CompareOp, DescribeQuery, Filter,
    InsertQuery, Query, ReshardCommand, SelectQuery, TableRef, WeightedPath,
};
pub use schema::{ColumnDef, DataType, Schema};
pub use types::{BatchSeq, ShardNum};
pub use value::{Row, Value};
