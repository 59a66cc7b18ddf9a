//! Shared fixtures for distributed table integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fathom_core::{Block, ColumnDef, DataType, Schema, TableRef, Value};
use fathom_distributed::{
    DistributedTable, InMemoryCatalog, InMemoryRegistry, InMemoryReshardingService,
    InMemoryStorage, LocalStorage, QueueConfig, SimulatedTransport, TableConfig, TableServices,
};
use fathom_routing::{Cluster, Endpoint, ShardConfig};
use fathom_spool::Storage;

/// Endpoint of replica `replica` of shard `shard` (both zero-based).
pub fn replica(shard: usize, replica: usize) -> Endpoint {
    Endpoint::new(format!("shard{shard}-r{replica}"), 9000)
}

/// Cluster with `local` local shards followed by `remote` remote shards,
/// each with `replicas` replicas.
pub fn cluster(local: usize, remote: usize, replicas: usize) -> Arc<Cluster> {
    let shards = (0..local)
        .map(|i| ShardConfig::local(Endpoint::new(format!("local{i}"), 9000)))
        .chain((0..remote).map(|i| {
            ShardConfig::remote((0..replicas).map(|r| replica(local + i, r)).collect())
        }))
        .collect();
    Arc::new(Cluster::new("test_cluster", shards).unwrap())
}

pub fn schema() -> Schema {
    Schema::new(vec![
        ColumnDef::new("id", DataType::UInt64),
        ColumnDef::new("name", DataType::String),
    ])
    .unwrap()
}

pub fn remote_table() -> TableRef {
    TableRef::new("db", "hits_local")
}

pub fn table_config() -> TableConfig {
    TableConfig::new("db", "hits_all", "db", "hits_local").with_queue_config(QueueConfig::for_testing())
}

/// Block of `(id, "row<id>")` rows.
pub fn rows(ids: &[u64]) -> Block {
    Block::new(
        vec!["id".to_string(), "name".to_string()],
        ids.iter()
            .map(|id| vec![Value::UInt(*id), Value::String(format!("row{id}"))])
            .collect(),
    )
    .unwrap()
}

/// Ids stored in a table of one simulated node, in write order.
pub fn ids_on(storage: &InMemoryStorage) -> Vec<u64> {
    storage
        .rows(&remote_table())
        .into_iter()
        .map(|row| match row[0] {
            Value::UInt(id) => id,
            ref other => panic!("unexpected id {other:?}"),
        })
        .collect()
}

/// Collaborators of a table, kept so tests can inspect them.
pub struct Fixture {
    pub transport: SimulatedTransport,
    pub local_storage: InMemoryStorage,
    pub catalog: InMemoryCatalog,
    pub registry: InMemoryRegistry,
    pub resharding: Arc<InMemoryReshardingService>,
}

impl Fixture {
    pub fn new() -> Self {
        let registry = InMemoryRegistry::new();
        Self {
            transport: SimulatedTransport::new(7),
            local_storage: InMemoryStorage::new(),
            catalog: InMemoryCatalog::new(),
            resharding: Arc::new(InMemoryReshardingService::new(registry.clone(), true)),
            registry,
        }
    }

    pub fn services(&self) -> TableServices {
        TableServices {
            transport: Arc::new(self.transport.clone()),
            local_storage: Arc::new(self.local_storage.clone()),
            catalog: Arc::new(self.catalog.clone()),
            resharding: Some(self.resharding.clone()),
        }
    }

    pub async fn open<S: Storage>(
        &self,
        config: TableConfig,
        cluster: Arc<Cluster>,
        spool: Arc<S>,
    ) -> DistributedTable<S> {
        DistributedTable::open(config, schema(), cluster, self.services(), spool)
            .await
            .unwrap()
    }

    /// Creates the backing table on local storage and on every replica.
    pub fn create_tables(&self, cluster: &Cluster) {
        self.local_storage.create_table(&remote_table(), schema());
        for shard in cluster.shards() {
            for endpoint in shard.remote_replicas() {
                self.node(endpoint).create_table(&remote_table(), schema());
            }
        }
    }

    /// Storage of the simulated node behind an endpoint.
    pub fn node(&self, endpoint: &Endpoint) -> InMemoryStorage {
        self.transport.node(endpoint)
    }
}

/// Writes `(id, "row<id>")` rows into the backing table of `storage`.
pub async fn seed(storage: &InMemoryStorage, ids: &[u64]) {
    storage.write(&remote_table(), rows(ids)).await.unwrap();
}

/// Polls `check` until it returns true, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
