//! Local storage collaborator.
//!
//! Local shards bypass the transport: inserts are written straight into
//! the backing table and queries are executed in-process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fathom_core::{aggregate_block, AlterCommand, Block, DataType, Query, Schema, TableRef, Value};

use crate::error::{DistError, DistResult};
use crate::fanout::ShardRequest;
use crate::stream::{block_stream, BlockStream};

/// Storage engine serving local shards.
#[async_trait]
pub trait LocalStorage: Send + Sync + 'static {
    /// Appends a block to a local table.
    ///
    /// # Errors
    /// Returns an error if the table rejects the block.
    async fn write(&self, target: &TableRef, block: Block) -> DistResult<()>;

    /// Executes a rewritten query against a local table.
    ///
    /// # Errors
    /// Returns an error if the query cannot be started.
    async fn read(&self, target: &TableRef, request: ShardRequest) -> DistResult<BlockStream>;
}

/// Fault injection for [`InMemoryStorage`].
#[derive(Debug, Clone, Default)]
pub struct StorageFaultConfig {
    /// If true, the next write fails.
    pub force_write_fail: bool,
    /// If true, the next read fails.
    pub force_read_fail: bool,
}

#[derive(Debug, Default)]
struct TableData {
    schema: Option<Schema>,
    data: Option<Block>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableRef, TableData>,
    requests: Vec<ShardRequest>,
    faults: StorageFaultConfig,
}

/// In-memory storage engine.
///
/// Runs selects, describes and column alters against tables held in
/// memory, and records every request it serves. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("storage lock poisoned")
    }

    /// Creates (or replaces) a table schema.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn create_table(&self, target: &TableRef, schema: Schema) {
        self.lock()
            .tables
            .entry(target.clone())
            .or_default()
            .schema = Some(schema);
    }

    /// Returns all rows stored in a table, in write order.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn rows(&self, target: &TableRef) -> Vec<Vec<Value>> {
        self.lock()
            .tables
            .get(target)
            .and_then(|t| t.data.as_ref())
            .map(|b| b.rows().to_vec())
            .unwrap_or_default()
    }

    /// Returns a table's schema.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn schema(&self, target: &TableRef) -> Option<Schema> {
        self.lock().tables.get(target).and_then(|t| t.schema.clone())
    }

    /// Returns every request served so far.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn requests(&self) -> Vec<ShardRequest> {
        self.lock().requests.clone()
    }

    /// Replaces the fault configuration.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn set_faults(&self, faults: StorageFaultConfig) {
        self.lock().faults = faults;
    }

    /// Appends a block, checking column layout against existing data.
    pub(crate) fn append(&self, target: &TableRef, block: Block) -> DistResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.faults.force_write_fail) {
            return Err(DistError::storage("write", "simulated write failure"));
        }
        let table = state.tables.entry(target.clone()).or_default();
        match &mut table.data {
            Some(existing) => existing.append(block)?,
            None => table.data = Some(block),
        }
        Ok(())
    }

    /// Executes a request and materializes the result.
    pub(crate) fn execute(&self, target: &TableRef, request: ShardRequest) -> DistResult<Vec<Block>> {
        let mut state = self.lock();
        if std::mem::take(&mut state.faults.force_read_fail) {
            return Err(DistError::storage("read", "simulated read failure"));
        }
        state.requests.push(request.clone());
        let table = state.tables.entry(target.clone()).or_default();

        match &request.query {
            Query::Select(select) => {
                let data = table.data.clone().unwrap_or_else(|| {
                    Block::empty(
                        table
                            .schema
                            .as_ref()
                            .map(Schema::column_names)
                            .unwrap_or_default(),
                    )
                });
                Ok(vec![aggregate_block(select, &data)?])
            }
            Query::Describe(_) => {
                let schema = table.schema.clone().unwrap_or_default();
                let rows = schema
                    .columns()
                    .iter()
                    .map(|c| describe_row(&c.name, c.data_type, &c.comment))
                    .collect();
                Ok(vec![Block::new(describe_columns(), rows)?])
            }
            Query::Alter(alter) => {
                let mut schema = table.schema.clone().unwrap_or_default();
                for command in &alter.commands {
                    if !matches!(command, AlterCommand::ReshardPartition(_)) {
                        schema.apply(command)?;
                    }
                }
                table.schema = Some(schema);
                Ok(Vec::new())
            }
            Query::Insert(_) => Err(DistError::InvalidArgument {
                name: "query",
                reason: "inserts are written, not read".to_string(),
            }),
        }
    }
}

/// Column layout of DESCRIBE results.
#[must_use]
pub fn describe_columns() -> Vec<String> {
    vec!["name".to_string(), "type".to_string(), "comment".to_string()]
}

/// Builds a DESCRIBE result row for a column.
#[must_use]
pub fn describe_row(name: &str, data_type: DataType, comment: &str) -> Vec<Value> {
    vec![
        Value::from(name),
        Value::from(data_type.to_string()),
        Value::from(comment),
    ]
}

#[async_trait]
impl LocalStorage for InMemoryStorage {
    async fn write(&self, target: &TableRef, block: Block) -> DistResult<()> {
        self.append(target, block)
    }

    async fn read(&self, target: &TableRef, request: ShardRequest) -> DistResult<BlockStream> {
        Ok(block_stream(self.execute(target, request)?))
    }
}
