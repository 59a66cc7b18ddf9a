//! Write routing and replication queue delivery.

mod common;

use std::sync::Arc;

use common::{cluster, eventually, ids_on, remote_table, replica, rows, table_config, Fixture};
use fathom_core::{Block, CoreError, InsertQuery, Query, SelectQuery, ShardNum, TableRef, Value};
use fathom_distributed::{collect_blocks, shard_dir_name, DistError, Settings};
use fathom_routing::{ProcessingStage, RoutingError};
use fathom_spool::{SimulatedStorage, TokioStorage};

fn insert() -> InsertQuery {
    InsertQuery::new(
        TableRef::new("db", "hits_all"),
        vec!["id".to_string(), "name".to_string()],
    )
}

fn sim_spool() -> Arc<SimulatedStorage> {
    Arc::new(SimulatedStorage::new(11))
}

#[tokio::test]
async fn test_write_enabled_matrix() {
    let fixture = Fixture::new();
    let cases = [
        // (local, remote, key, data path, expected)
        (0, 1, false, true, true),
        (1, 0, false, true, true),
        (0, 2, false, true, false),
        (1, 1, false, true, false),
        (0, 2, true, true, true),
        (2, 3, true, true, true),
        (0, 1, false, false, false),
        (0, 3, true, false, false),
    ];

    for (local, remote, key, data_path, expected) in cases {
        let mut config = table_config();
        if key {
            config = config.with_sharding_key("id");
        }
        if data_path {
            config = config.with_data_path("/data");
        }
        let table = fixture
            .open(config, cluster(local, remote, 1), sim_spool())
            .await;
        assert_eq!(
            table.is_write_enabled(),
            expected,
            "local={local} remote={remote} key={key} data_path={data_path}"
        );
        table.shutdown().await;
    }
}

#[tokio::test]
async fn test_write_rejected_without_sharding_key() {
    let fixture = Fixture::new();
    let table = fixture
        .open(table_config().with_data_path("/data"), cluster(0, 2, 1), sim_spool())
        .await;

    let err = table.write(&insert(), &Settings::new()).unwrap_err();
    match err {
        DistError::Configuration { message } => {
            assert_eq!(message, "write not supported: multiple shards and no sharding key");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_write_rejected_without_data_path() {
    let fixture = Fixture::new();
    let table = fixture
        .open(table_config().with_sharding_key("id"), cluster(0, 2, 1), sim_spool())
        .await;

    let err = table.write(&insert(), &Settings::new()).unwrap_err();
    assert!(matches!(
        err,
        DistError::Configuration { ref message } if message == "write not supported: no data path"
    ));
}

#[tokio::test]
async fn test_rows_are_routed_by_sharding_key() {
    let fixture = Fixture::new();
    let config = table_config()
        .with_sharding_key("(id + 2) % 3")
        .with_data_path("/data");
    let table = fixture.open(config, cluster(0, 3, 1), sim_spool()).await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[1, 2, 3, 4, 5, 6])).await.unwrap();
    let summary = sink.finish();

    assert_eq!(summary.total_rows(), 6);
    assert_eq!(
        summary.rows_per_shard,
        vec![
            (ShardNum::new(1), 2),
            (ShardNum::new(2), 2),
            (ShardNum::new(3), 2)
        ]
    );

    let expected = [vec![1, 4], vec![2, 5], vec![3, 6]];
    for (shard, ids) in expected.iter().enumerate() {
        let node = fixture.node(&replica(shard, 0));
        eventually("rows on every shard", || {
            let node = node.clone();
            async move { ids_on(&node).len() == 2 }
        })
        .await;
        assert_eq!(&ids_on(&node), ids, "shard {shard}");
    }

    // Reading back without the final merge returns every row once.
    let select = Query::Select(SelectQuery::new(
        TableRef::new("db", "hits_all"),
        vec!["id".to_string()],
    ));
    let settings = Settings::new().with_group_by_no_merge(true);
    let (stage, stream) = table
        .read(&["id".to_string()], &select, &settings, &[])
        .await
        .unwrap();
    assert_eq!(stage, ProcessingStage::Complete);
    let mut ids: Vec<Value> = collect_blocks(stream)
        .await
        .unwrap()
        .into_iter()
        .flat_map(Block::into_rows)
        .map(|row| row[0].clone())
        .collect();
    ids.sort_by(|a, b| a.compare(b).unwrap());
    assert_eq!(ids, (1..=6).map(Value::UInt).collect::<Vec<_>>());
    table.shutdown().await;
}

#[tokio::test]
async fn test_weights_skew_routing() {
    let fixture = Fixture::new();
    let shards = vec![
        fathom_routing::ShardConfig::remote(vec![replica(0, 0)]).with_weight(1),
        fathom_routing::ShardConfig::remote(vec![replica(1, 0)]).with_weight(3),
    ];
    let cluster = Arc::new(fathom_routing::Cluster::new("weighted", shards).unwrap());
    let config = table_config().with_sharding_key("id").with_data_path("/data");
    let table = fixture.open(config, cluster, sim_spool()).await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[0, 1, 2, 3, 4, 5, 6, 7])).await.unwrap();
    let summary = sink.finish();

    // Slot 0 belongs to shard 1, slots 1..=3 to shard 2.
    assert_eq!(
        summary.rows_per_shard,
        vec![(ShardNum::new(1), 2), (ShardNum::new(2), 6)]
    );
    table.shutdown().await;
}

#[tokio::test]
async fn test_local_shard_written_before_write_returns() {
    let fixture = Fixture::new();
    let config = table_config().with_sharding_key("id % 2").with_data_path("/data");
    let table = fixture.open(config, cluster(1, 1, 1), sim_spool()).await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[1, 2, 3, 4])).await.unwrap();

    assert_eq!(ids_on(&fixture.local_storage), vec![2, 4]);

    let remote = fixture.node(&replica(1, 0));
    eventually("remote rows", || {
        let remote = remote.clone();
        async move { ids_on(&remote) == vec![1, 3] }
    })
    .await;
    table.shutdown().await;
}

#[tokio::test]
async fn test_single_shard_without_key_takes_every_row() {
    let fixture = Fixture::new();
    let table = fixture
        .open(table_config().with_data_path("/data"), cluster(0, 1, 1), sim_spool())
        .await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[10, 20, 30])).await.unwrap();
    assert_eq!(sink.finish().rows_per_shard, vec![(ShardNum::new(1), 3)]);

    let node = fixture.node(&replica(0, 0));
    eventually("rows delivered", || {
        let node = node.clone();
        async move { ids_on(&node) == vec![10, 20, 30] }
    })
    .await;
    table.shutdown().await;
}

#[tokio::test]
async fn test_insert_is_rewritten_to_remote_table() {
    let fixture = Fixture::new();
    let table = fixture
        .open(table_config().with_data_path("/data"), cluster(0, 1, 1), sim_spool())
        .await;

    let mut insert = insert();
    insert.select = Some(Box::new(SelectQuery::new(
        TableRef::new("db", "source"),
        vec!["id".to_string(), "name".to_string()],
    )));
    let sink = table.write(&insert, &Settings::new()).unwrap();

    assert_eq!(sink.insert().target, remote_table());
    assert!(sink.insert().select.is_none());
    assert_eq!(sink.insert().columns, insert.columns);
    // The caller's query is untouched.
    assert!(insert.select.is_some());
}

#[tokio::test]
async fn test_failed_deliveries_keep_per_shard_order() {
    let fixture = Fixture::new();
    fixture.transport.fail_next_batches(3);
    let table = fixture
        .open(table_config().with_data_path("/data"), cluster(0, 1, 1), sim_spool())
        .await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    for id in 1..=4 {
        sink.write(rows(&[id])).await.unwrap();
    }

    let node = fixture.node(&replica(0, 0));
    eventually("all batches delivered", || {
        let node = node.clone();
        async move { ids_on(&node).len() == 4 }
    })
    .await;
    assert_eq!(ids_on(&node), vec![1, 2, 3, 4]);

    let stats = table.queue_stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].failures, 3);
    assert_eq!(stats[0].delivered, 4);
    table.shutdown().await;
}

#[tokio::test]
async fn test_queue_fails_over_to_second_replica() {
    let fixture = Fixture::new();
    fixture.transport.set_down(&replica(0, 0), true);
    let table = fixture
        .open(table_config().with_data_path("/data"), cluster(0, 1, 2), sim_spool())
        .await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[1])).await.unwrap();

    let second = fixture.node(&replica(0, 1));
    eventually("delivery to second replica", || {
        let second = second.clone();
        async move { ids_on(&second) == vec![1] }
    })
    .await;
    assert!(ids_on(&fixture.node(&replica(0, 0))).is_empty());
    table.shutdown().await;
}

#[tokio::test]
async fn test_spooled_batches_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();
    fixture.transport.set_down(&replica(0, 0), true);
    let config = table_config().with_data_path(dir.path());
    let spool = Arc::new(TokioStorage);

    let table = fixture
        .open(config.clone(), cluster(0, 1, 1), Arc::clone(&spool))
        .await;
    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[1, 2])).await.unwrap();
    sink.write(rows(&[3])).await.unwrap();
    let stats = table.queue_stats().await.unwrap();
    assert_eq!(stats[0].pending, 2);
    table.shutdown().await;
    drop(table);

    let queue_dir = dir
        .path()
        .join("hits_all")
        .join(shard_dir_name(&[replica(0, 0)]));
    assert!(queue_dir.is_dir());

    fixture.transport.set_down(&replica(0, 0), false);
    let table = fixture.open(config, cluster(0, 1, 1), spool).await;
    assert_eq!(table.queue_names().await, vec![shard_dir_name(&[replica(0, 0)])]);

    let node = fixture.node(&replica(0, 0));
    eventually("redelivery after restart", || {
        let node = node.clone();
        async move { ids_on(&node) == vec![1, 2, 3] }
    })
    .await;
    table.shutdown().await;
}

#[tokio::test]
async fn test_queue_of_removed_shard_still_drains() {
    let fixture = Fixture::new();
    fixture.transport.set_down(&replica(0, 0), true);
    let spool = sim_spool();
    let config = table_config().with_data_path("/data");

    let table = fixture
        .open(config.clone(), cluster(0, 1, 1), Arc::clone(&spool))
        .await;
    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    sink.write(rows(&[42])).await.unwrap();
    table.shutdown().await;

    // The new cluster no longer contains the old shard.
    let other = Arc::new(
        fathom_routing::Cluster::new(
            "other",
            vec![fathom_routing::ShardConfig::remote(vec![replica(9, 0)])],
        )
        .unwrap(),
    );
    fixture.transport.set_down(&replica(0, 0), false);
    let table = fixture.open(config, other, spool).await;

    let node = fixture.node(&replica(0, 0));
    eventually("orphaned queue drained", || {
        let node = node.clone();
        async move { ids_on(&node) == vec![42] }
    })
    .await;
    table.shutdown().await;
}

#[tokio::test]
async fn test_key_evaluation_failure_fails_write() {
    let fixture = Fixture::new();
    let config = table_config().with_sharding_key("id / 0").with_data_path("/data");
    let table = fixture.open(config, cluster(0, 2, 1), sim_spool()).await;

    let mut sink = table.write(&insert(), &Settings::new()).unwrap();
    let err = sink.write(rows(&[1])).await.unwrap_err();
    assert!(matches!(err, DistError::Routing(RoutingError::Evaluation { .. })));
    assert!(table.queue_names().await.is_empty());
}

#[tokio::test]
async fn test_blocks_are_checked_against_schema() {
    let fixture = Fixture::new();
    let table = fixture
        .open(table_config().with_data_path("/data"), cluster(0, 1, 1), sim_spool())
        .await;
    let mut sink = table.write(&insert(), &Settings::new()).unwrap();

    let unknown = Block::new(vec!["nope".to_string()], vec![vec![Value::UInt(1)]]).unwrap();
    let err = sink.write(unknown).await.unwrap_err();
    assert!(matches!(err, DistError::Core(CoreError::ColumnNotFound { .. })));

    let wrong_type = Block::new(vec!["id".to_string()], vec![vec![Value::from("x")]]).unwrap();
    let err = sink.write(wrong_type).await.unwrap_err();
    assert!(matches!(err, DistError::Core(CoreError::TypeMismatch { .. })));

    assert_eq!(sink.finish().total_rows(), 0);
    table.shutdown().await;
}

#[tokio::test]
async fn test_unknown_sharding_key_column_rejected_at_open() {
    let fixture = Fixture::new();
    let result = fathom_distributed::DistributedTable::open(
        table_config().with_sharding_key("user_id").with_data_path("/data"),
        common::schema(),
        cluster(0, 2, 1),
        fixture.services(),
        sim_spool(),
    )
    .await;
    assert!(matches!(result, Err(DistError::Configuration { .. })));
}
