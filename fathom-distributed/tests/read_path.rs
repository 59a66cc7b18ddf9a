//! Query fan-out, stage selection and failure propagation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{cluster, remote_table, replica, seed, table_config, Fixture};
use fathom_core::{
    Aggregate, AggregateFunction, Block, CompareOp, CoreError, DataType, DescribeQuery, Filter,
    InsertQuery, Query, SelectQuery, ShardNum, TableRef, Value,
};
use fathom_distributed::{
    collect_blocks, describe_row, DistError, ErrorCallback, ExternalTable, FanOutExecutor,
    GlobalSubqueriesMethod, ScriptedResponse, SelectQueryConstructor, Settings,
};
use fathom_routing::ProcessingStage;
use fathom_spool::SimulatedStorage;
use futures::FutureExt;

fn spool() -> Arc<SimulatedStorage> {
    Arc::new(SimulatedStorage::new(3))
}

fn dist() -> TableRef {
    TableRef::new("db", "hits_all")
}

fn select(columns: &[&str]) -> Query {
    Query::Select(SelectQuery::new(
        dist(),
        columns.iter().map(ToString::to_string).collect(),
    ))
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

fn sorted_ids(blocks: &[Block]) -> Vec<u64> {
    let mut ids: Vec<u64> = blocks
        .iter()
        .flat_map(|b| b.rows().iter())
        .map(|row| match row[0] {
            Value::UInt(id) => id,
            ref other => panic!("unexpected id {other:?}"),
        })
        .collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn test_processing_stage_follows_fan_out_width() {
    let fixture = Fixture::new();
    let cases = [
        // (local, remote, max_parallel_replicas, no_merge, expected)
        (0, 1, 1, false, ProcessingStage::Complete),
        (1, 0, 1, false, ProcessingStage::Complete),
        (0, 2, 1, false, ProcessingStage::WithMergeableState),
        (1, 1, 1, false, ProcessingStage::WithMergeableState),
        (0, 1, 2, false, ProcessingStage::WithMergeableState),
        (1, 0, 4, false, ProcessingStage::Complete),
        (0, 3, 1, true, ProcessingStage::Complete),
    ];

    for (local, remote, replicas, no_merge, expected) in cases {
        let cluster = cluster(local, remote, 1);
        fixture.create_tables(&cluster);
        let table = fixture.open(table_config(), cluster, spool()).await;
        let settings = Settings::new()
            .with_max_parallel_replicas(replicas)
            .with_group_by_no_merge(no_merge);

        let (stage, stream) = table
            .read(&columns(&["id"]), &select(&["id"]), &settings, &[])
            .await
            .unwrap();
        assert_eq!(
            stage, expected,
            "local={local} remote={remote} replicas={replicas} no_merge={no_merge}"
        );
        collect_blocks(stream).await.unwrap();
    }
}

#[tokio::test]
async fn test_read_unions_every_shard() {
    let fixture = Fixture::new();
    let cluster = cluster(1, 2, 1);
    fixture.create_tables(&cluster);
    seed(&fixture.local_storage, &[1, 2]).await;
    seed(&fixture.node(&replica(1, 0)), &[3]).await;
    seed(&fixture.node(&replica(2, 0)), &[4, 5]).await;
    let table = fixture.open(table_config(), cluster, spool()).await;

    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &Settings::new(), &[])
        .await
        .unwrap();
    let blocks = collect_blocks(stream).await.unwrap();
    assert_eq!(sorted_ids(&blocks), vec![1, 2, 3, 4, 5]);

    // Every remote shard received the query rewritten to the backing table.
    let queries = fixture.transport.queries();
    assert_eq!(queries.len(), 2);
    for (_, request) in queries {
        assert_eq!(request.query.target(), &remote_table());
        assert_eq!(request.stage, ProcessingStage::WithMergeableState);
    }
}

#[tokio::test]
async fn test_partial_aggregates_are_merged() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    seed(&fixture.node(&replica(0, 0)), &[1, 2]).await;
    seed(&fixture.node(&replica(1, 0)), &[3]).await;
    let table = fixture.open(table_config(), cluster, spool()).await;

    let query = Query::Select(
        SelectQuery::new(dist(), Vec::new())
            .with_aggregate(Aggregate::count())
            .with_aggregate(Aggregate::of(AggregateFunction::Sum, "id"))
            .with_aggregate(Aggregate::of(AggregateFunction::Max, "id")),
    );
    let (stage, stream) = table
        .read(&columns(&["id"]), &query, &Settings::new(), &[])
        .await
        .unwrap();
    assert_eq!(stage, ProcessingStage::WithMergeableState);

    let blocks = collect_blocks(stream).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(
        blocks[0].rows(),
        [vec![Value::UInt(3), Value::UInt(6), Value::UInt(3)]]
    );
}

#[tokio::test]
async fn test_group_by_no_merge_returns_per_shard_rows() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    seed(&fixture.node(&replica(0, 0)), &[1, 2]).await;
    seed(&fixture.node(&replica(1, 0)), &[3]).await;
    let table = fixture.open(table_config(), cluster, spool()).await;

    let query = Query::Select(SelectQuery::new(dist(), Vec::new()).with_aggregate(Aggregate::count()));
    let settings = Settings::new().with_group_by_no_merge(true);
    let (stage, stream) = table
        .read(&columns(&["id"]), &query, &settings, &[])
        .await
        .unwrap();
    assert_eq!(stage, ProcessingStage::Complete);

    let mut counts: Vec<Value> = collect_blocks(stream)
        .await
        .unwrap()
        .into_iter()
        .flat_map(Block::into_rows)
        .map(|row| row[0].clone())
        .collect();
    counts.sort_by(|a, b| a.compare(b).unwrap());
    assert_eq!(counts, vec![Value::UInt(1), Value::UInt(2)]);
}

#[tokio::test]
async fn test_filter_is_pushed_to_shards() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    seed(&fixture.node(&replica(0, 0)), &[1, 5]).await;
    seed(&fixture.node(&replica(1, 0)), &[7, 2]).await;
    let table = fixture.open(table_config(), cluster, spool()).await;

    let query = Query::Select(
        SelectQuery::new(dist(), columns(&["id"])).with_filter(Filter {
            column: "id".to_string(),
            op: CompareOp::Gt,
            value: Value::UInt(4),
        }),
    );
    let (_, stream) = table
        .read(&columns(&["id"]), &query, &Settings::new(), &[])
        .await
        .unwrap();
    assert_eq!(sorted_ids(&collect_blocks(stream).await.unwrap()), vec![5, 7]);
}

#[tokio::test]
async fn test_external_tables_forwarded_only_with_push() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    let table = fixture.open(table_config(), cluster, spool()).await;
    let external = vec![ExternalTable {
        name: "_data1".to_string(),
        block: common::rows(&[1]),
    }];

    // Pull is the default: shards evaluate GLOBAL subqueries themselves.
    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &Settings::new(), &external)
        .await
        .unwrap();
    collect_blocks(stream).await.unwrap();
    assert!(fixture
        .transport
        .queries()
        .iter()
        .all(|(_, r)| r.external_tables.is_empty()));

    let push = Settings::new().with_global_subqueries_method(GlobalSubqueriesMethod::Push);
    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &push, &external)
        .await
        .unwrap();
    collect_blocks(stream).await.unwrap();
    let queries = fixture.transport.queries();
    assert_eq!(queries.len(), 4);
    assert!(queries[2..].iter().all(|(_, r)| r.external_tables == external));
}

#[tokio::test]
async fn test_read_fails_over_to_next_replica() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 1, 2);
    fixture.create_tables(&cluster);
    fixture.transport.set_down(&replica(0, 0), true);
    seed(&fixture.node(&replica(0, 1)), &[8, 9]).await;
    let table = fixture.open(table_config(), cluster, spool()).await;

    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &Settings::new(), &[])
        .await
        .unwrap();
    assert_eq!(sorted_ids(&collect_blocks(stream).await.unwrap()), vec![8, 9]);

    let endpoints: Vec<_> = fixture.transport.queries().into_iter().map(|(e, _)| e).collect();
    assert_eq!(endpoints, vec![replica(0, 0), replica(0, 1)]);
}

#[tokio::test]
async fn test_all_replicas_down_fails_shard() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 1, 2);
    fixture.transport.set_down(&replica(0, 0), true);
    fixture.transport.set_down(&replica(0, 1), true);
    let table = fixture.open(table_config(), cluster, spool()).await;

    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &Settings::new(), &[])
        .await
        .unwrap();
    let err = collect_blocks(stream).await.unwrap_err();
    assert!(matches!(err, DistError::ShardFailure { shard, .. } if shard == ShardNum::new(1)));
}

fn executor(fixture: &Fixture, cluster: Arc<fathom_routing::Cluster>) -> FanOutExecutor {
    FanOutExecutor::new(
        cluster,
        remote_table(),
        Arc::new(fixture.transport.clone()),
        Arc::new(fixture.local_storage.clone()),
    )
}

fn counting_callback(counter: &Arc<AtomicUsize>) -> ErrorCallback {
    let counter = Arc::clone(counter);
    Arc::new(move |_: &DistError| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_first_error_cancels_hanging_siblings() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 3, 1);
    fixture.create_tables(&cluster);
    fixture
        .transport
        .script(&replica(0, 0), ScriptedResponse::StreamError("disk failure".to_string()));
    fixture.transport.script(&replica(1, 0), ScriptedResponse::Hang);
    fixture.transport.script(&replica(2, 0), ScriptedResponse::Hang);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut merged = executor(&fixture, cluster).execute(
        &select(&["id"]),
        &SelectQueryConstructor,
        &Settings::new(),
        &[],
        false,
        Some(counting_callback(&calls)),
    );

    let err = loop {
        match merged.next().await {
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e,
            None => panic!("stream ended without the shard error"),
        }
    };
    match err {
        DistError::ShardFailure { shard, message } => {
            assert_eq!(shard, ShardNum::new(1));
            assert!(message.contains("disk failure"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(merged.next().await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Hanging shards observe the cancellation and stop.
    tokio::time::timeout(Duration::from_secs(5), merged.close())
        .await
        .expect("hanging shard tasks were not cancelled");
}

#[tokio::test]
async fn test_error_callback_runs_once_for_many_failures() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 3, 1);
    for shard in 0..3 {
        fixture
            .transport
            .script(&replica(shard, 0), ScriptedResponse::StreamError(format!("boom {shard}")));
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let merged = executor(&fixture, cluster).execute(
        &select(&["id"]),
        &SelectQueryConstructor,
        &Settings::new(),
        &[],
        false,
        Some(counting_callback(&calls)),
    );
    let result = collect_blocks(merged.into_stream()).await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_shard_is_reported_as_unknown_fault() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    fixture
        .transport
        .script(&replica(1, 0), ScriptedResponse::Panic("replica exploded".to_string()));
    let table = fixture.open(table_config(), cluster, spool()).await;

    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &Settings::new(), &[])
        .await
        .unwrap();
    let err = collect_blocks(stream).await.unwrap_err();
    match err {
        DistError::ShardFailure { shard, message } => {
            assert_eq!(shard, ShardNum::new(2));
            assert_eq!(message, "unknown fault");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_single_connection_still_reads_every_shard() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 3, 1);
    fixture.create_tables(&cluster);
    for shard in 0..3 {
        seed(&fixture.node(&replica(shard, 0)), &[shard as u64]).await;
    }
    let table = fixture.open(table_config(), cluster, spool()).await;

    let settings = Settings::new().with_max_distributed_connections(1);
    let (_, stream) = table
        .read(&columns(&["id"]), &select(&["id"]), &settings, &[])
        .await
        .unwrap();
    assert_eq!(sorted_ids(&collect_blocks(stream).await.unwrap()), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_virtual_columns_are_filled_per_shard() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    seed(&fixture.node(&replica(0, 0)), &[10]).await;
    seed(&fixture.node(&replica(1, 0)), &[20]).await;
    let table = fixture.open(table_config(), cluster, spool()).await;

    let (_, stream) = table
        .read(
            &columns(&["id", "_shard_num", "_table"]),
            &select(&["id", "_shard_num", "_table"]),
            &Settings::new(),
            &[],
        )
        .await
        .unwrap();
    let mut rows: Vec<Vec<Value>> = collect_blocks(stream)
        .await
        .unwrap()
        .into_iter()
        .flat_map(Block::into_rows)
        .collect();
    rows.sort_by(|a, b| a[0].compare(&b[0]).unwrap());
    assert_eq!(
        rows,
        vec![
            vec![Value::UInt(10), Value::UInt(1), Value::from("hits_local")],
            vec![Value::UInt(20), Value::UInt(2), Value::from("hits_local")],
        ]
    );

    // Shards never see the virtual columns.
    for (_, request) in fixture.transport.queries() {
        let Query::Select(sent) = request.query else {
            panic!("expected select");
        };
        assert_eq!(sent.columns, columns(&["id"]));
    }
}

#[tokio::test]
async fn test_columns_include_virtual_columns() {
    let fixture = Fixture::new();
    let table = fixture.open(table_config(), cluster(2, 3, 1), spool()).await;

    assert_eq!(table.shard_count(), 3);
    assert_eq!(table.column("_table").await.unwrap().data_type, DataType::String);
    assert_eq!(table.column("_shard_num").await.unwrap().data_type, DataType::UInt64);
    assert!(table.has_column("id").await);
    assert!(!table.has_column("missing").await);
}

#[tokio::test]
async fn test_read_rejects_bad_requests() {
    let fixture = Fixture::new();
    let table = fixture.open(table_config(), cluster(0, 2, 1), spool()).await;

    let Err(err) = table
        .read(&columns(&["missing"]), &select(&["missing"]), &Settings::new(), &[])
        .await
    else {
        panic!("read of an unknown column succeeded");
    };
    assert!(matches!(err, DistError::Core(CoreError::ColumnNotFound { .. })));

    let insert = Query::Insert(InsertQuery::new(dist(), columns(&["id"])));
    let Err(err) = table
        .read(&columns(&["id"]), &insert, &Settings::new(), &[])
        .await
    else {
        panic!("read of an INSERT succeeded");
    };
    assert!(matches!(err, DistError::InvalidArgument { .. }));

    let bad = Settings::new().with_max_parallel_replicas(0);
    assert!(table
        .read(&columns(&["id"]), &select(&["id"]), &bad, &[])
        .await
        .is_err());
}

#[tokio::test]
async fn test_describe_fans_out_to_every_shard() {
    let fixture = Fixture::new();
    let cluster = cluster(0, 2, 1);
    fixture.create_tables(&cluster);
    let table = fixture.open(table_config(), cluster, spool()).await;

    let blocks = collect_blocks(table.describe(&Settings::new()).unwrap())
        .await
        .unwrap();
    let rows: Vec<Vec<Value>> = blocks.into_iter().flat_map(Block::into_rows).collect();
    assert_eq!(rows.len(), 4);
    assert!(rows.contains(&describe_row("id", DataType::UInt64, "")));

    for (_, request) in fixture.transport.queries() {
        assert_eq!(
            request.query,
            Query::Describe(DescribeQuery {
                target: remote_table()
            })
        );
        assert_eq!(request.stage, ProcessingStage::Complete);
    }
}
