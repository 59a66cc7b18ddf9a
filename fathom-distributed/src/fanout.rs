//! Query fan-out.
//!
//! A query against a distributed table is rewritten once per shard to
//! target the underlying table, dispatched to every shard, and the shard
//! results are merged into one stream.
//!
//! # Dispatch
//!
//! Local shards are served by [`LocalStorage`]. Remote shards go through
//! the [`Transport`], trying replicas in order until one accepts the
//! connection. Every shard runs in its own task; at most
//! `max_distributed_connections` of them hold a connection at once.
//!
//! # Failure
//!
//! A shard error, or a panic inside a shard task, is reported as
//! [`DistError::ShardFailure`] through the merged stream, which then
//! cancels every sibling (see [`MergedStream`]).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use fathom_core::{Block, Query, ShardNum, TableRef, Value};
use fathom_routing::{processing_stage, Cluster, Endpoint, ProcessingStage};
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{GlobalSubqueriesMethod, Settings};
use crate::error::{DistError, DistResult};
use crate::storage::LocalStorage;
use crate::stream::BlockStream;
use crate::transport::Transport;
use crate::union::{ErrorCallback, MergedStream};

/// Capacity of the channel shard tasks push blocks into.
const MERGE_CHANNEL_CAPACITY: usize = 64;

/// Virtual column holding the name of the table a row was read from.
pub const VIRTUAL_TABLE_COLUMN: &str = "_table";

/// Virtual column holding the one-based number of the shard a row came from.
pub const VIRTUAL_SHARD_NUM_COLUMN: &str = "_shard_num";

/// Returns true for columns filled in by the fan-out rather than storage.
#[must_use]
pub fn is_virtual_column(name: &str) -> bool {
    name == VIRTUAL_TABLE_COLUMN || name == VIRTUAL_SHARD_NUM_COLUMN
}

// -----------------------------------------------------------------------------
// Shard requests
// -----------------------------------------------------------------------------

/// Temporary table shipped alongside a query (the result of a GLOBAL
/// subquery).
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalTable {
    /// Name the shard query refers to.
    pub name: String,
    /// Contents.
    pub block: Block,
}

/// What one shard is asked to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRequest {
    /// The query, rewritten to target the shard's table.
    pub query: Query,
    /// Stage the shard must process the query to.
    pub stage: ProcessingStage,
    /// Temporary tables the query may read.
    pub external_tables: Vec<ExternalTable>,
}

/// Builds the request each shard receives for one kind of query.
pub trait QueryConstructor: Send + Sync {
    /// Kind of query, for logs.
    fn kind(&self) -> &'static str;

    /// Builds the request for one shard.
    fn shard_request(
        &self,
        query: &Query,
        remote: &TableRef,
        stage: ProcessingStage,
        settings: &Settings,
        external_tables: &[ExternalTable],
    ) -> ShardRequest;
}

/// Constructor for SELECT queries.
///
/// Shards stop at the chosen stage. External tables are forwarded only
/// when subqueries are pushed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectQueryConstructor;

impl QueryConstructor for SelectQueryConstructor {
    fn kind(&self) -> &'static str {
        "select"
    }

    fn shard_request(
        &self,
        query: &Query,
        remote: &TableRef,
        stage: ProcessingStage,
        settings: &Settings,
        external_tables: &[ExternalTable],
    ) -> ShardRequest {
        let external_tables = match settings.global_subqueries_method {
            GlobalSubqueriesMethod::Push => external_tables.to_vec(),
            GlobalSubqueriesMethod::Pull => Vec::new(),
        };
        ShardRequest {
            query: query.with_target(&remote.database, &remote.table),
            stage,
            external_tables,
        }
    }
}

/// Constructor for DESCRIBE queries. Always complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescribeQueryConstructor;

impl QueryConstructor for DescribeQueryConstructor {
    fn kind(&self) -> &'static str {
        "describe"
    }

    fn shard_request(
        &self,
        query: &Query,
        remote: &TableRef,
        _stage: ProcessingStage,
        _settings: &Settings,
        _external_tables: &[ExternalTable],
    ) -> ShardRequest {
        ShardRequest {
            query: query.with_target(&remote.database, &remote.table),
            stage: ProcessingStage::Complete,
            external_tables: Vec::new(),
        }
    }
}

/// Constructor for ALTER queries, including resharding. Always complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlterQueryConstructor;

impl QueryConstructor for AlterQueryConstructor {
    fn kind(&self) -> &'static str {
        "alter"
    }

    fn shard_request(
        &self,
        query: &Query,
        remote: &TableRef,
        _stage: ProcessingStage,
        _settings: &Settings,
        _external_tables: &[ExternalTable],
    ) -> ShardRequest {
        ShardRequest {
            query: query.with_target(&remote.database, &remote.table),
            stage: ProcessingStage::Complete,
            external_tables: Vec::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// Executor
// -----------------------------------------------------------------------------

/// Dispatches queries to every shard of a cluster.
pub struct FanOutExecutor {
    cluster: Arc<Cluster>,
    remote: TableRef,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn LocalStorage>,
}

impl std::fmt::Debug for FanOutExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutExecutor")
            .field("cluster", &self.cluster.name())
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl FanOutExecutor {
    /// Creates an executor for one remote table on one cluster.
    #[must_use]
    pub fn new(
        cluster: Arc<Cluster>,
        remote: TableRef,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        Self {
            cluster,
            remote,
            transport,
            storage,
        }
    }

    /// Sends `query` to every shard and merges the results.
    ///
    /// Must be called from within a tokio runtime. Shard multiplexing is
    /// not implemented; when requested it is logged and ignored.
    #[must_use]
    pub fn execute(
        &self,
        query: &Query,
        constructor: &dyn QueryConstructor,
        settings: &Settings,
        external_tables: &[ExternalTable],
        enable_shard_multiplexing: bool,
        on_error: Option<ErrorCallback>,
    ) -> MergedStream {
        if enable_shard_multiplexing {
            info!(
                kind = constructor.kind(),
                "shard multiplexing requested but not supported, using one stream per shard"
            );
        }

        let stage = processing_stage(
            &self.cluster,
            settings.max_parallel_replicas,
            settings.distributed_group_by_no_merge,
        );

        // Virtual columns are filled in per shard; storage never sees them.
        let (shard_query, virtual_layout) = strip_virtual_columns(query);
        let request = constructor.shard_request(
            &shard_query,
            &self.remote,
            stage,
            settings,
            external_tables,
        );
        let stage = request.stage;

        let (tx, rx) = mpsc::channel(MERGE_CHANNEL_CAPACITY);
        let (cancel, _) = watch::channel(false);
        let permits = usize::try_from(settings.max_distributed_connections).unwrap_or(usize::MAX);
        let semaphore = Arc::new(Semaphore::new(permits.min(Semaphore::MAX_PERMITS)));

        let mut tasks = Vec::with_capacity(self.cluster.shards().len());
        for shard in self.cluster.shards() {
            let task = ShardTask {
                shard_num: shard.shard_num(),
                replicas: if shard.is_local() {
                    None
                } else {
                    Some(shard.remote_replicas().to_vec())
                },
                remote: self.remote.clone(),
                request: request.clone(),
                virtual_layout: virtual_layout.clone(),
                transport: Arc::clone(&self.transport),
                storage: Arc::clone(&self.storage),
                semaphore: Arc::clone(&semaphore),
            };
            tasks.push(tokio::spawn(run_shard(task, tx.clone(), cancel.subscribe())));
        }
        drop(tx);

        debug!(
            kind = constructor.kind(),
            shards = tasks.len(),
            stage = %stage,
            remote = %self.remote,
            "fanned out query"
        );

        let merged = MergedStream::new(stage, rx, cancel, tasks, on_error);
        match query {
            Query::Select(select)
                if stage == ProcessingStage::WithMergeableState && select.is_aggregating() =>
            {
                merged.with_final_merge(select.clone())
            }
            _ => merged,
        }
    }
}

/// Removes virtual columns from a plain select and returns the original
/// column order so shard tasks can rebuild it.
fn strip_virtual_columns(query: &Query) -> (Query, Option<Vec<String>>) {
    match query {
        Query::Select(select)
            if !select.is_aggregating() && select.columns.iter().any(|c| is_virtual_column(c)) =>
        {
            let mut stripped = select.clone();
            stripped.columns.retain(|c| !is_virtual_column(c));
            (Query::Select(stripped), Some(select.columns.clone()))
        }
        _ => (query.clone(), None),
    }
}

// -----------------------------------------------------------------------------
// Shard tasks
// -----------------------------------------------------------------------------

struct ShardTask {
    shard_num: ShardNum,
    /// `None` for local shards.
    replicas: Option<Vec<Endpoint>>,
    remote: TableRef,
    request: ShardRequest,
    virtual_layout: Option<Vec<String>>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn LocalStorage>,
    semaphore: Arc<Semaphore>,
}

impl ShardTask {
    async fn open(&self) -> DistResult<BlockStream> {
        let Some(replicas) = &self.replicas else {
            return self.storage.read(&self.remote, self.request.clone()).await;
        };

        let mut last_error = None;
        for endpoint in replicas {
            match self.transport.send_query(endpoint, self.request.clone()).await {
                Ok(stream) => {
                    debug!(shard = %self.shard_num, endpoint = %endpoint, "replica accepted query");
                    return Ok(stream);
                }
                Err(e) if e.is_connection_failure() => {
                    warn!(shard = %self.shard_num, endpoint = %endpoint, error = %e, "replica unreachable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| DistError::configuration("shard has no remote replicas")))
    }

    fn fill_virtual(&self, block: Block) -> DistResult<Block> {
        let Some(layout) = &self.virtual_layout else {
            return Ok(block);
        };
        let sources: Vec<Option<usize>> = layout
            .iter()
            .map(|name| {
                if is_virtual_column(name) {
                    Ok(None)
                } else {
                    block
                        .column_index(name)
                        .map(Some)
                        .ok_or_else(|| fathom_core::CoreError::column_not_found(name.clone()))
                }
            })
            .collect::<Result<_, _>>()?;

        let rows = block
            .rows()
            .iter()
            .map(|row| {
                layout
                    .iter()
                    .zip(&sources)
                    .map(|(name, source)| match source {
                        Some(i) => row[*i].clone(),
                        None if name == VIRTUAL_SHARD_NUM_COLUMN => Value::UInt(self.shard_num.get()),
                        None => Value::String(self.remote.table.clone()),
                    })
                    .collect()
            })
            .collect();
        Ok(Block::new(layout.clone(), rows)?)
    }
}

async fn run_shard(
    task: ShardTask,
    tx: mpsc::Sender<DistResult<Block>>,
    cancel: watch::Receiver<bool>,
) {
    let shard = task.shard_num;
    let mut cancelled = cancel.clone();
    let result = AssertUnwindSafe(drive_shard(task, tx.clone(), cancel))
        .catch_unwind()
        .await;

    let message = match result {
        Ok(Ok(()) | Err(DistError::Cancelled)) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "unknown fault".to_string(),
    };
    warn!(shard = %shard, error = %message, "shard failed");
    // A sibling's error may already have been yielded; nobody is listening then.
    tokio::select! {
        _ = tx.send(Err(DistError::ShardFailure { shard, message })) => {}
        _ = cancelled.changed() => {}
    }
}

async fn drive_shard(
    task: ShardTask,
    tx: mpsc::Sender<DistResult<Block>>,
    mut cancel: watch::Receiver<bool>,
) -> DistResult<()> {
    let _permit = tokio::select! {
        permit = Arc::clone(&task.semaphore).acquire_owned() => {
            permit.map_err(|_| DistError::Cancelled)?
        }
        _ = cancel.changed() => return Err(DistError::Cancelled),
    };

    let mut stream = tokio::select! {
        stream = task.open() => stream?,
        _ = cancel.changed() => return Err(DistError::Cancelled),
    };

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(block)) => {
                    let block = task.fill_virtual(block)?;
                    tokio::select! {
                        sent = tx.send(Ok(block)) => sent.map_err(|_| DistError::Cancelled)?,
                        _ = cancel.changed() => return Err(DistError::Cancelled),
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            _ = cancel.changed() => return Err(DistError::Cancelled),
        }
    }
}
