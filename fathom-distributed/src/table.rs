//! The distributed table.
//!
//! A distributed table stores nothing itself. Reads fan out to the
//! underlying table on every shard of a cluster; writes are split by the
//! sharding key and either written to local storage or spooled for the
//! shard's replication queue.
//!
//! # Spool Layout
//!
//! ```text
//! <data_path>/<escaped table name>/<escaped replica list>/
//!     00000000000000000001.bin
//!     tmp/
//!     broken/
//! ```
//!
//! The replica list is the comma-joined `host:port` of every replica of
//! the shard. Queues are discovered from these directories when the table
//! opens, so batches spooled before a restart are still delivered, even
//! for shards that left the cluster.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use fathom_core::{
    AlterCommand, Block, ColumnDef, CoreError, DataType, DescribeQuery, InsertQuery, Query,
    ReshardCommand, Schema, ShardNum,
};
use fathom_routing::{
    compile, split_block, Cluster, Clusters, Endpoint, Expression, ProcessingStage, RoutedBlock,
    Shard, ShardingExpression,
};
use fathom_spool::{Storage, TokioStorage};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::{Settings, TableConfig};
use crate::error::{DistError, DistResult};
use crate::fanout::{
    is_virtual_column, DescribeQueryConstructor, ExternalTable, FanOutExecutor,
    SelectQueryConstructor, VIRTUAL_SHARD_NUM_COLUMN, VIRTUAL_TABLE_COLUMN,
};
use crate::queue::{QueueStats, ReplicationQueue};
use crate::registry::ReshardingService;
use crate::reshard::ReshardingCoordinatorClient;
use crate::storage::LocalStorage;
use crate::stream::BlockStream;
use crate::transport::Transport;

/// Collaborators a table talks to.
#[derive(Clone)]
pub struct TableServices {
    /// Client for remote shards.
    pub transport: Arc<dyn Transport>,
    /// Storage behind local shards.
    pub local_storage: Arc<dyn LocalStorage>,
    /// Persists schema changes.
    pub catalog: Arc<dyn Catalog>,
    /// Resharding worker, if this server runs one.
    pub resharding: Option<Arc<dyn ReshardingService>>,
}

impl std::fmt::Debug for TableServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableServices")
            .field("resharding", &self.resharding.is_some())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// DistributedTable
// -----------------------------------------------------------------------------

/// A table whose data lives in the shards of a cluster.
pub struct DistributedTable<S: Storage = TokioStorage> {
    config: TableConfig,
    cluster: Arc<Cluster>,
    sharding_key: Option<Expression>,
    write_enabled: bool,
    /// Structural lock: alters hold it for writing.
    schema: RwLock<Schema>,
    services: TableServices,
    executor: Arc<FanOutExecutor>,
    resharding: ReshardingCoordinatorClient,
    spool_storage: Arc<S>,
    queues: Mutex<HashMap<String, Arc<ReplicationQueue<S>>>>,
}

impl<S: Storage> std::fmt::Debug for DistributedTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedTable")
            .field("table", &self.config.table_ref())
            .field("remote", &self.config.remote_ref())
            .field("cluster", &self.cluster.name())
            .field("write_enabled", &self.write_enabled)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> DistributedTable<S> {
    /// Opens a table over `cluster`.
    ///
    /// Compiles the sharding key and starts one replication queue for
    /// every spool directory left by a previous run.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the sharding key
    /// does not compile, or the spool cannot be scanned.
    pub async fn open(
        config: TableConfig,
        schema: Schema,
        cluster: Arc<Cluster>,
        services: TableServices,
        spool_storage: Arc<S>,
    ) -> DistResult<Self> {
        config.validate()?;

        let sharding_key = config.sharding_key.as_deref().map(compile).transpose()?;
        if let Some(key) = &sharding_key {
            for column in key.required_columns() {
                if schema.column(&column).is_none() {
                    return Err(DistError::configuration(format!(
                        "sharding key uses unknown column {column}"
                    )));
                }
            }
        }

        let shards = cluster.local_shard_count() + cluster.remote_shard_count();
        let write_enabled =
            config.data_path.is_some() && (shards < 2 || sharding_key.is_some());

        let remote = config.remote_ref();
        let executor = Arc::new(FanOutExecutor::new(
            Arc::clone(&cluster),
            remote.clone(),
            Arc::clone(&services.transport),
            Arc::clone(&services.local_storage),
        ));
        let resharding = ReshardingCoordinatorClient::new(
            services.resharding.clone(),
            Arc::clone(&executor),
            Arc::clone(&cluster),
            remote,
        );

        let table = Self {
            cluster,
            sharding_key,
            write_enabled,
            schema: RwLock::new(schema),
            services,
            executor,
            resharding,
            spool_storage,
            queues: Mutex::new(HashMap::new()),
            config,
        };
        table.discover_queues().await?;

        info!(
            table = %table.config.table_ref(),
            cluster = table.cluster.name(),
            shards,
            write_enabled,
            "opened distributed table"
        );
        Ok(table)
    }

    /// Opens a table over the cluster named `cluster_name`.
    ///
    /// # Errors
    /// Returns `ClusterNotFound` for unknown clusters, otherwise as
    /// [`DistributedTable::open`].
    pub async fn open_in(
        clusters: &Clusters,
        cluster_name: &str,
        config: TableConfig,
        schema: Schema,
        services: TableServices,
        spool_storage: Arc<S>,
    ) -> DistResult<Self> {
        let cluster = clusters.get(cluster_name)?;
        Self::open(config, schema, cluster, services, spool_storage).await
    }

    /// Table configuration.
    #[must_use]
    pub const fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Cluster the table spans.
    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Whether inserts are accepted.
    #[must_use]
    pub const fn is_write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// Result column name of the sharding key.
    #[must_use]
    pub fn sharding_key_column(&self) -> Option<&str> {
        self.sharding_key.as_ref().map(ShardingExpression::column_name)
    }

    /// Number of remote shards.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.cluster.remote_shard_count()
    }

    /// Current schema.
    pub async fn schema(&self) -> Schema {
        self.schema.read().await.clone()
    }

    /// Looks up a column, including the virtual `_table` and `_shard_num`.
    pub async fn column(&self, name: &str) -> Option<ColumnDef> {
        match name {
            VIRTUAL_TABLE_COLUMN => Some(ColumnDef::new(name, DataType::String)),
            VIRTUAL_SHARD_NUM_COLUMN => Some(ColumnDef::new(name, DataType::UInt64)),
            _ => self.schema.read().await.column(name).cloned(),
        }
    }

    /// Whether a column (real or virtual) exists.
    pub async fn has_column(&self, name: &str) -> bool {
        self.column(name).await.is_some()
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    /// Runs a SELECT on every shard.
    ///
    /// Returns the stage shards processed the query to and the merged
    /// result. Aggregates computed to the mergeable stage are combined
    /// before they are yielded.
    ///
    /// # Errors
    /// Returns an error if the query is not a SELECT, names an unknown
    /// column, or the settings are invalid. Shard failures surface through
    /// the stream.
    pub async fn read(
        &self,
        columns: &[String],
        query: &Query,
        settings: &Settings,
        external_tables: &[ExternalTable],
    ) -> DistResult<(ProcessingStage, BlockStream)> {
        settings.validate()?;
        let Query::Select(select) = query else {
            return Err(DistError::InvalidArgument {
                name: "query",
                reason: format!("read expects a SELECT, got: {query}"),
            });
        };
        for column in columns {
            if !self.has_column(column).await {
                return Err(CoreError::column_not_found(column.clone()).into());
            }
        }
        if select.is_aggregating()
            && select
                .group_by
                .iter()
                .chain(select.aggregates.iter().filter_map(|a| a.column.as_ref()))
                .any(|c| is_virtual_column(c))
        {
            return Err(DistError::UnsupportedOperation {
                message: "virtual columns cannot be aggregated".to_string(),
            });
        }

        let merged = self.executor.execute(
            query,
            &SelectQueryConstructor,
            settings,
            external_tables,
            false,
            None,
        );
        Ok((merged.stage(), merged.into_stream()))
    }

    /// Runs DESCRIBE on every shard.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid.
    pub fn describe(&self, settings: &Settings) -> DistResult<BlockStream> {
        settings.validate()?;
        let query = Query::Describe(DescribeQuery {
            target: self.config.table_ref(),
        });
        let merged = self.executor.execute(
            &query,
            &DescribeQueryConstructor,
            settings,
            &[],
            false,
            None,
        );
        Ok(merged.into_stream())
    }

    // -------------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------------

    /// Starts an insert.
    ///
    /// The insert is rewritten to target the remote table; an
    /// `INSERT ... SELECT` source is dropped since rows arrive through the
    /// sink.
    ///
    /// # Errors
    /// Returns `Configuration` if the table does not accept writes.
    pub fn write(&self, insert: &InsertQuery, settings: &Settings) -> DistResult<DistributedSink<'_, S>> {
        settings.validate()?;
        if !self.write_enabled {
            let reason = if self.config.data_path.is_none() {
                "no data path"
            } else {
                "multiple shards and no sharding key"
            };
            return Err(DistError::configuration(format!(
                "write not supported: {reason}"
            )));
        }

        let rewritten = InsertQuery::new(self.config.remote_ref(), insert.columns.clone());
        debug!(table = %self.config.table_ref(), insert = %rewritten, "started insert");
        Ok(DistributedSink {
            table: self,
            insert: rewritten,
            rows_per_shard: vec![0; self.cluster.shards().len()],
            blocks: 0,
        })
    }

    /// Returns the queue for a remote shard, creating it on first use.
    async fn queue_for(&self, shard: &Shard) -> DistResult<Arc<ReplicationQueue<S>>> {
        let name = shard_dir_name(shard.remote_replicas());
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(&name) {
            return Ok(Arc::clone(queue));
        }

        let queue = Arc::new(
            ReplicationQueue::open(
                name.clone(),
                self.spool_root()?.join(&name),
                shard.remote_replicas().to_vec(),
                Arc::clone(&self.spool_storage),
                Arc::clone(&self.services.transport),
                self.config.queue.clone(),
            )
            .await?,
        );
        queues.insert(name, Arc::clone(&queue));
        drop(queues);
        Ok(queue)
    }

    fn spool_root(&self) -> DistResult<PathBuf> {
        let data_path = self
            .config
            .data_path
            .as_ref()
            .ok_or_else(|| DistError::configuration("table has no data path"))?;
        Ok(data_path.join(escape_for_file_name(&self.config.name)))
    }

    async fn discover_queues(&self) -> DistResult<()> {
        if self.config.data_path.is_none() {
            return Ok(());
        }
        let root = self.spool_root()?;
        self.spool_storage.create_dir_all(&root).await?;

        let mut queues = self.queues.lock().await;
        for dir in self.spool_storage.list_dirs(&root).await? {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let Some(replicas) = parse_shard_dir_name(&name) else {
                warn!(dir = %dir.display(), "ignoring spool directory with unrecognized name");
                continue;
            };
            let queue = ReplicationQueue::open(
                name.clone(),
                dir,
                replicas,
                Arc::clone(&self.spool_storage),
                Arc::clone(&self.services.transport),
                self.config.queue.clone(),
            )
            .await?;
            queues.insert(name, Arc::new(queue));
        }
        drop(queues);
        Ok(())
    }

    /// Names of the open replication queues.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Statistics of every replication queue, sorted by name.
    ///
    /// # Errors
    /// Returns an error if a spool cannot be read.
    pub async fn queue_stats(&self) -> DistResult<Vec<QueueStats>> {
        let queues: Vec<Arc<ReplicationQueue<S>>> =
            self.queues.lock().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            stats.push(queue.stats().await?);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Schema changes and resharding
    // -------------------------------------------------------------------------

    /// Applies column changes.
    ///
    /// The catalog is updated first; the table publishes the new schema
    /// only if that succeeds.
    ///
    /// # Errors
    /// Returns `UnsupportedOperation` for primary key changes and any
    /// validation or catalog error. On error nothing changes.
    pub async fn alter(&self, commands: &[AlterCommand]) -> DistResult<()> {
        for command in commands {
            match command {
                AlterCommand::ModifyPrimaryKey { .. } => {
                    return Err(DistError::UnsupportedOperation {
                        message: "distributed tables have no primary key".to_string(),
                    });
                }
                AlterCommand::ReshardPartition(_) => {
                    return Err(DistError::InvalidArgument {
                        name: "commands",
                        reason: "use reshard_partitions for RESHARD".to_string(),
                    });
                }
                _ => {}
            }
        }

        let mut schema = self.schema.write().await;
        let mut altered = schema.clone();
        for command in commands {
            altered.apply(command)?;
        }
        if let Some(key) = &self.sharding_key {
            for column in key.required_columns() {
                if altered.column(&column).is_none() {
                    return Err(DistError::InvalidArgument {
                        name: "commands",
                        reason: format!("column {column} is used by the sharding key"),
                    });
                }
            }
        }

        self.services
            .catalog
            .alter_table(&self.config.table_ref(), &altered)
            .await?;
        *schema = altered;
        drop(schema);

        info!(table = %self.config.table_ref(), commands = commands.len(), "altered table");
        Ok(())
    }

    /// Reshards partitions of the remote table across the cluster.
    ///
    /// # Errors
    /// See [`ReshardingCoordinatorClient::reshard`].
    pub async fn reshard_partitions(
        &self,
        request: &ReshardCommand,
        settings: &Settings,
    ) -> DistResult<()> {
        settings.validate()?;
        self.resharding.reshard(request, settings).await
    }

    /// Stops every replication queue. Spooled batches stay on disk.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<ReplicationQueue<S>>> =
            self.queues.lock().await.drain().map(|(_, q)| q).collect();
        for queue in &queues {
            queue.shutdown().await;
        }
        info!(table = %self.config.table_ref(), queues = queues.len(), "shut down distributed table");
    }
}

// -----------------------------------------------------------------------------
// DistributedSink
// -----------------------------------------------------------------------------

/// Rows written through one sink, per shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Blocks written.
    pub blocks: u64,
    /// Rows per shard, for shards that received any.
    pub rows_per_shard: Vec<(ShardNum, u64)>,
}

impl WriteSummary {
    /// Total rows written.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.rows_per_shard.iter().map(|(_, rows)| rows).sum()
    }
}

/// Accepts blocks for one insert and routes them to shards.
pub struct DistributedSink<'a, S: Storage> {
    table: &'a DistributedTable<S>,
    insert: InsertQuery,
    rows_per_shard: Vec<u64>,
    blocks: u64,
}

impl<S: Storage> std::fmt::Debug for DistributedSink<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSink")
            .field("insert", &self.insert)
            .field("blocks", &self.blocks)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> DistributedSink<'_, S> {
    /// The rewritten insert.
    #[must_use]
    pub const fn insert(&self) -> &InsertQuery {
        &self.insert
    }

    /// Routes one block.
    ///
    /// Local shards are written before this returns; remote shards have
    /// their part durably spooled.
    ///
    /// # Errors
    /// Returns an error if the block does not match the schema, the
    /// sharding key cannot be computed, or any write or spool append
    /// fails.
    pub async fn write(&mut self, block: Block) -> DistResult<()> {
        if block.is_empty() {
            return Ok(());
        }
        self.check_block(&block).await?;

        let table = self.table;
        let cluster = &table.cluster;
        let routed = match &table.sharding_key {
            Some(key) => split_block(cluster, key, &block)?,
            None => vec![RoutedBlock {
                shard_index: 0,
                block,
            }],
        };

        for part in routed {
            let shard = &cluster.shards()[part.shard_index];
            let rows = part.block.num_rows() as u64;
            if shard.is_local() {
                table
                    .services
                    .local_storage
                    .write(&self.insert.target, part.block)
                    .await?;
            } else {
                let queue = table.queue_for(shard).await?;
                queue.enqueue(&self.insert, part.block).await?;
            }
            self.rows_per_shard[part.shard_index] += rows;
            debug!(shard = %shard.shard_num(), rows, local = shard.is_local(), "routed block");
        }
        self.blocks += 1;
        Ok(())
    }

    async fn check_block(&self, block: &Block) -> DistResult<()> {
        let schema = self.table.schema.read().await;
        let columns: Vec<&ColumnDef> = block
            .columns()
            .iter()
            .map(|name| {
                schema
                    .column(name)
                    .ok_or_else(|| CoreError::column_not_found(name.clone()))
            })
            .collect::<Result<_, _>>()?;

        for row in block.rows() {
            for (def, value) in columns.iter().zip(row) {
                if !def.data_type.accepts(value) {
                    return Err(CoreError::TypeMismatch {
                        column: def.name.clone(),
                        expected: def.data_type.name(),
                        actual: value.type_name(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Finishes the insert.
    #[must_use]
    pub fn finish(self) -> WriteSummary {
        let rows_per_shard = self
            .table
            .cluster
            .shards()
            .iter()
            .zip(self.rows_per_shard)
            .filter(|(_, rows)| *rows > 0)
            .map(|(shard, rows)| (shard.shard_num(), rows))
            .collect();
        WriteSummary {
            blocks: self.blocks,
            rows_per_shard,
        }
    }
}

// -----------------------------------------------------------------------------
// File names
// -----------------------------------------------------------------------------

/// Escapes a string for use as a file name. ASCII letters, digits and `_`
/// are kept; every other byte becomes `%XX`.
#[must_use]
pub fn escape_for_file_name(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            escaped.push(char::from(byte));
        } else {
            // Writing to a String cannot fail.
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}

/// Reverses [`escape_for_file_name`]. Returns `None` for malformed input.
#[must_use]
pub fn unescape_for_file_name(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Spool directory name of a shard.
#[must_use]
pub fn shard_dir_name(replicas: &[Endpoint]) -> String {
    let joined: Vec<String> = replicas.iter().map(ToString::to_string).collect();
    escape_for_file_name(&joined.join(","))
}

/// Replicas encoded in a spool directory name.
#[must_use]
pub fn parse_shard_dir_name(name: &str) -> Option<Vec<Endpoint>> {
    let decoded = unescape_for_file_name(name)?;
    decoded
        .split(',')
        .map(|replica| {
            let (host, port) = replica.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some(Endpoint::new(host, port.parse().ok()?))
        })
        .collect()
}
