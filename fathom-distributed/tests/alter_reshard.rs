//! Schema changes and resharding jobs.

mod common;

use std::sync::Arc;

use common::{cluster, remote_table, replica, table_config, Fixture};
use fathom_core::{AlterCommand, ColumnDef, DataType, ReshardCommand, TableRef, Value, WeightedPath};
use async_trait::async_trait;
use fathom_distributed::{
    CoordinatorRegistry, CoordinatorStatus, DistError, DistResult, DistributedTable,
    InMemoryRegistry, RegistryFaultConfig, ReshardingService, ScriptedResponse, Settings,
};
use fathom_spool::SimulatedStorage;

fn spool() -> Arc<SimulatedStorage> {
    Arc::new(SimulatedStorage::new(11))
}

fn dist() -> TableRef {
    TableRef::new("db", "hits_all")
}

fn reshard_command() -> ReshardCommand {
    ReshardCommand {
        first_partition: Some(Value::UInt(201_601)),
        last_partition: None,
        weighted_paths: vec![
            WeightedPath::new("/tables/hits/01", 1),
            WeightedPath::new("/tables/hits/02", 2),
        ],
        sharding_key: "id".to_string(),
        do_copy: false,
        coordinator: None,
    }
}

async fn open_table(fixture: &Fixture) -> DistributedTable<SimulatedStorage> {
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    fixture
        .open(table_config().with_sharding_key("id"), cluster, spool())
        .await
}

// -----------------------------------------------------------------------------
// ALTER
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_alter_updates_catalog_then_schema() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;

    table
        .alter(&[
            AlterCommand::AddColumn {
                column: ColumnDef::new("visits", DataType::UInt64),
                after: Some("id".to_string()),
            },
            AlterCommand::CommentColumn {
                name: "name".to_string(),
                comment: "page title".to_string(),
            },
        ])
        .await
        .unwrap();

    let schema = table.schema().await;
    assert_eq!(schema.column_names(), vec!["id", "visits", "name"]);
    assert_eq!(schema.column("name").unwrap().comment, "page title");
    assert_eq!(fixture.catalog.alter_count(), 1);
    assert_eq!(fixture.catalog.schema(&dist()), Some(schema));
    assert!(table.has_column("visits").await);
}

#[tokio::test]
async fn test_alter_rejects_primary_key_changes() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;

    let err = table
        .alter(&[AlterCommand::ModifyPrimaryKey {
            columns: vec!["id".to_string()],
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::UnsupportedOperation { .. }));
    assert_eq!(fixture.catalog.alter_count(), 0);
}

#[tokio::test]
async fn test_alter_rejects_reshard_commands() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;

    let err = table
        .alter(&[AlterCommand::ReshardPartition(reshard_command())])
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::InvalidArgument { .. }));
    assert!(fixture.registry.issued_ids().is_empty());
}

#[tokio::test]
async fn test_failed_catalog_update_keeps_schema() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    let before = table.schema().await;
    fixture.catalog.fail_next_alter();

    let err = table
        .alter(&[AlterCommand::DropColumn {
            name: "name".to_string(),
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::Catalog { .. }));
    assert_eq!(table.schema().await, before);
    assert!(table.has_column("name").await);
}

#[tokio::test]
async fn test_alter_cannot_drop_sharding_key_column() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;

    let err = table
        .alter(&[AlterCommand::DropColumn {
            name: "id".to_string(),
        }])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("sharding key"), "{err}");
    assert!(table.has_column("id").await);
    assert_eq!(fixture.catalog.alter_count(), 0);
}

#[tokio::test]
async fn test_invalid_alter_changes_nothing() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;

    let err = table
        .alter(&[
            AlterCommand::AddColumn {
                column: ColumnDef::new("visits", DataType::UInt64),
                after: None,
            },
            AlterCommand::DropColumn {
                name: "missing".to_string(),
            },
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::Core(_)));
    assert!(!table.has_column("visits").await);
    assert_eq!(fixture.catalog.alter_count(), 0);
}

// -----------------------------------------------------------------------------
// Resharding
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_reshard_registers_broadcasts_and_deletes_coordinator() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;

    table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap();

    let ids = fixture.registry.issued_ids();
    assert_eq!(ids, vec!["coordinator-0001".to_string()]);
    assert!(fixture.registry.record(&ids[0]).is_none());
    assert_eq!(fixture.registry.delete_calls(&ids[0]), 1);
    assert!(fixture.registry.status_updates().is_empty());

    // Every shard received the ALTER bound to the coordinator.
    let queries = fixture.transport.queries();
    assert_eq!(queries.len(), 2);
    for (_, request) in queries {
        assert_eq!(request.query.target(), &remote_table());
        let text = request.query.to_string();
        assert!(text.contains("RESHARD PARTITION 201601"), "{text}");
        assert!(text.contains("COORDINATE WITH 'coordinator-0001'"), "{text}");
    }
}

#[tokio::test]
async fn test_reshard_delete_failure_after_success_is_returned() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    // Keep the record alive after the job so its queries can be inspected.
    fixture.registry.set_faults(RegistryFaultConfig {
        force_delete_fail: true,
        ..RegistryFaultConfig::default()
    });

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::Registry { operation: "delete", .. }));

    let record = fixture.registry.record("coordinator-0001").unwrap();
    assert_eq!(record.status, CoordinatorStatus::Running);
    assert_eq!(record.queries.len(), 1);
    assert!(record.queries[0].starts_with("ALTER TABLE db.hits_local RESHARD"));
    assert!(record.queries[0].ends_with("COORDINATE WITH 'coordinator-0001'"));
    assert_eq!(fixture.registry.delete_calls("coordinator-0001"), 1);
}

#[tokio::test]
async fn test_reshard_requires_running_service() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    fixture.resharding.set_started(false);

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::ServiceUnavailable { .. }));
    assert!(fixture.registry.issued_ids().is_empty());
    assert!(fixture.transport.queries().is_empty());
}

#[tokio::test]
async fn test_reshard_without_service() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    let mut services = fixture.services();
    services.resharding = None;
    let table = DistributedTable::open(table_config(), common::schema(), cluster, services, spool())
        .await
        .unwrap();

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::ServiceUnavailable { .. }));
}

#[tokio::test]
async fn test_reshard_rejects_explicit_coordinator() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    let mut command = reshard_command();
    command.coordinator = Some("elsewhere".to_string());

    let err = table
        .reshard_partitions(&command, &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::InvalidArgument { name: "coordinator", .. }));
    assert!(fixture.registry.issued_ids().is_empty());
}

#[tokio::test]
async fn test_reshard_create_failure_needs_no_cleanup() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    fixture.registry.set_faults(RegistryFaultConfig {
        force_create_fail: true,
        ..RegistryFaultConfig::default()
    });

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::Registry { operation: "create", .. }));
    assert!(fixture.registry.issued_ids().is_empty());
    assert!(fixture.transport.queries().is_empty());
}

/// Checks the cleanup contract after a failed job: the coordinator was
/// marked failed exactly once and deleted exactly once.
fn assert_cleaned_up(fixture: &Fixture) {
    let id = "coordinator-0001";
    assert!(fixture.registry.record(id).is_none());
    assert_eq!(fixture.registry.delete_calls(id), 1);
    assert_eq!(
        fixture.registry.status_updates(),
        vec![(id.to_string(), CoordinatorStatus::Error)]
    );
}

#[tokio::test]
async fn test_register_failure_cleans_up() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    fixture.registry.set_faults(RegistryFaultConfig {
        force_register_fail: true,
        ..RegistryFaultConfig::default()
    });

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::Registry { operation: "register_query", .. }));
    assert!(fixture.transport.queries().is_empty());
    assert_cleaned_up(&fixture);
}

#[tokio::test]
async fn test_shard_failure_marks_coordinator_and_cleans_up() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    fixture
        .transport
        .script(&replica(1, 0), ScriptedResponse::StreamError("partition locked".to_string()));

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    match err {
        DistError::ShardFailure { message, .. } => assert!(message.contains("partition locked")),
        other => panic!("unexpected error: {other}"),
    }
    assert_cleaned_up(&fixture);
}

#[tokio::test]
async fn test_panicking_shard_marks_coordinator_and_cleans_up() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    fixture
        .transport
        .script(&replica(0, 0), ScriptedResponse::Panic("worker crashed".to_string()));

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::ShardFailure { ref message, .. } if message == "unknown fault"));
    assert_cleaned_up(&fixture);
}

/// Registry whose `register_query` panics; everything else is delegated.
struct PanickingRegistry(InMemoryRegistry);

#[async_trait]
impl CoordinatorRegistry for PanickingRegistry {
    async fn create_coordinator(&self, cluster_descriptor: &str) -> DistResult<String> {
        self.0.create_coordinator(cluster_descriptor).await
    }

    async fn register_query(&self, _coordinator_id: &str, _query: &str) -> DistResult<()> {
        panic!("registry client crashed");
    }

    async fn set_status(
        &self,
        coordinator_id: &str,
        status: CoordinatorStatus,
        message: &str,
    ) -> DistResult<()> {
        self.0.set_status(coordinator_id, status, message).await
    }

    async fn dump_state(&self, coordinator_id: &str) -> DistResult<String> {
        self.0.dump_state(coordinator_id).await
    }

    async fn delete_coordinator(&self, coordinator_id: &str) -> DistResult<()> {
        self.0.delete_coordinator(coordinator_id).await
    }
}

struct PanickingService(Arc<PanickingRegistry>);

impl ReshardingService for PanickingService {
    fn is_started(&self) -> bool {
        true
    }

    fn registry(&self) -> Arc<dyn CoordinatorRegistry> {
        self.0.clone()
    }
}

#[tokio::test]
async fn test_panic_during_job_still_cleans_up() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    let mut services = fixture.services();
    services.resharding = Some(Arc::new(PanickingService(Arc::new(PanickingRegistry(
        fixture.registry.clone(),
    )))));
    let table = DistributedTable::open(
        table_config().with_sharding_key("id"),
        common::schema(),
        cluster,
        services,
        spool(),
    )
    .await
    .unwrap();

    let err = table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DistError::Panicked { .. }));
    assert_cleaned_up(&fixture);
    assert!(fixture.transport.queries().is_empty());
}

#[tokio::test]
async fn test_unreachable_shard_releases_barrier_waiters() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    // One participant blocks on the barrier while the other cannot connect.
    fixture.transport.script(&replica(0, 0), ScriptedResponse::Hang);
    fixture.transport.set_down(&replica(1, 0), true);

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        table.reshard_partitions(&reshard_command(), &Settings::new()),
    )
    .await
    .expect("resharding never gave up")
    .unwrap_err();
    assert!(matches!(err, DistError::ShardFailure { .. }));
    assert_cleaned_up(&fixture);
}

#[tokio::test]
async fn test_cleanup_failures_keep_original_error() {
    let faults = [
        RegistryFaultConfig {
            force_status_fail: true,
            ..RegistryFaultConfig::default()
        },
        RegistryFaultConfig {
            force_dump_fail: true,
            ..RegistryFaultConfig::default()
        },
        RegistryFaultConfig {
            force_delete_fail: true,
            ..RegistryFaultConfig::default()
        },
    ];

    for fault in faults {
        let fixture = Fixture::new();
        let table = open_table(&fixture).await;
        fixture
            .transport
            .script(&replica(0, 0), ScriptedResponse::StreamError("disk full".to_string()));
        fixture.registry.set_faults(fault.clone());

        let err = table
            .reshard_partitions(&reshard_command(), &Settings::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, DistError::ShardFailure { ref message, .. } if message.contains("disk full")),
            "{fault:?}: {err}"
        );
        assert_eq!(fixture.registry.delete_calls("coordinator-0001"), 1, "{fault:?}");
    }
}

#[tokio::test]
async fn test_status_failure_in_callback_is_retried_by_cleanup() {
    let fixture = Fixture::new();
    let table = open_table(&fixture).await;
    fixture
        .transport
        .script(&replica(0, 0), ScriptedResponse::StreamError("disk full".to_string()));
    fixture.registry.set_faults(RegistryFaultConfig {
        force_status_fail: true,
        ..RegistryFaultConfig::default()
    });

    table
        .reshard_partitions(&reshard_command(), &Settings::new())
        .await
        .unwrap_err();
    assert_cleaned_up(&fixture);
}
