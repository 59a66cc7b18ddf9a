//! Fathom Distributed - a table engine spanning the shards of a cluster.
//!
//! A distributed table holds no data of its own. It provides:
//!
//! - **Reads**: queries are rewritten per shard, sent to local storage or
//!   to remote replicas, and the results are merged into one stream
//! - **Writes**: inserted blocks are split by a sharding expression;
//!   remote parts go through durable per-shard replication queues
//! - **Resharding**: a coordinated, cluster-wide `RESHARD` job whose
//!   failure releases every participant
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Durable before acknowledged**: An insert returns only after every
//!   remote part is on disk
//! - **Per-shard ordering**: A queue never sends entry N+1 before entry N
//! - **One-shot failure**: The first shard error cancels its siblings
//! - **Explicit collaborators**: Transport, storage, catalog and registry
//!   are traits with in-memory implementations for tests
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod catalog;
mod config;
mod error;
mod fanout;
mod queue;
mod registry;
mod reshard;
mod storage;
mod stream;
mod table;
mod transport;
mod union;

pub use catalog::{Catalog, InMemoryCatalog};
pub use config::{
    ConfigError, GlobalSubqueriesMethod, QueueConfig, Settings, TableConfig,
    MAX_DISTRIBUTED_CONNECTIONS_DEFAULT, QUEUE_INITIAL_BACKOFF_MS, QUEUE_MAX_BACKOFF_MS,
};
pub use error::{DistError, DistResult};
pub use fanout::{
    is_virtual_column, AlterQueryConstructor, DescribeQueryConstructor, ExternalTable,
    FanOutExecutor, QueryConstructor, SelectQueryConstructor, ShardRequest,
    VIRTUAL_SHARD_NUM_COLUMN, VIRTUAL_TABLE_COLUMN,
};
pub use queue::{QueueState, QueueStats, QueuedBatch, ReplicationQueue};
pub use registry::{
    CoordinatorRecord, CoordinatorRegistry, CoordinatorStatus, InMemoryRegistry,
    InMemoryReshardingService, RegistryFaultConfig, ReshardingService,
};
pub use reshard::ReshardingCoordinatorClient;
pub use storage::{describe_columns, describe_row, InMemoryStorage, LocalStorage, StorageFaultConfig};
pub use stream::{block_stream, collect_blocks, BlockStream};
pub use table::{
    escape_for_file_name, parse_shard_dir_name, shard_dir_name, unescape_for_file_name,
    DistributedSink, DistributedTable, TableServices, WriteSummary,
};
pub use transport::{DeliveredBatch, ScriptedResponse, SimulatedTransport, Transport};
pub use union::{ErrorCallback, MergedStream};
