//! Cluster behaviour against in-memory backends

use std::sync::Arc;
use std::time::Duration;

use wolfcluster::prelude::*;

fn items() -> TableSchema {
    TableSchema::new(
        "items",
        vec![
            ColumnSchema::new("id", "BIGINT").not_null().auto_increment(),
            ColumnSchema::new("name", "VARCHAR(64)"),
        ],
        &["id"],
    )
}

fn rows(n: i64) -> Vec<Row> {
    (1..=n)
        .map(|i| vec![Value::Int(i), Value::from(format!("item {i}"))])
        .collect()
}

fn options() -> ClusterOptions {
    ClusterOptions {
        scheduler_tick: Duration::from_millis(20),
        reconnect_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn cluster() -> DatabaseCluster {
    DatabaseCluster::new(vec![items()], options())
}

fn insert(id: i64, name: &str) -> WriteAction {
    WriteAction::single(Mutation::Insert {
        table: "items".into(),
        columns: vec!["id".into(), "name".into()],
        values: vec![Value::Int(id), Value::from(name)],
        generated_key: None,
    })
}

fn insert_generated(name: &str) -> WriteAction {
    WriteAction::single(Mutation::Insert {
        table: "items".into(),
        columns: vec!["name".into()],
        values: vec![Value::from(name)],
        generated_key: Some("id".into()),
    })
}

async fn wait_for_status(cluster: &DatabaseCluster, id: &BackendId, status: MemberStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.status(id).await != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never became {status}"));
}

/// A cluster whose first member `a` holds `n` rows and is ready
async fn seeded(n: i64) -> (DatabaseCluster, Arc<MemoryBackend>) {
    let cluster = cluster();
    let a = Arc::new(MemoryBackend::new("a").with_table(items(), rows(n)).unwrap());
    assert!(cluster.add_database_and_wait(a.clone()).await.unwrap());
    (cluster, a)
}

#[tokio::test]
async fn test_registry_never_empties() {
    let cluster = cluster();
    for id in ["a", "b", "c"] {
        cluster
            .add_database_and_wait(Arc::new(MemoryBackend::new(id)))
            .await
            .unwrap();
    }

    cluster.remove_database(&"a".into()).await.unwrap();
    cluster.remove_database(&"b".into()).await.unwrap();
    assert!(matches!(
        cluster.remove_database(&"c".into()).await,
        Err(Error::CannotRemoveLastMember)
    ));
    assert_eq!(cluster.status(&"a".into()).await, MemberStatus::Unknown);
    assert_eq!(cluster.status(&"c".into()).await, MemberStatus::Ready);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_first_member_gets_required_tables() {
    let cluster = cluster();
    let a = Arc::new(MemoryBackend::new("a"));
    cluster.add_database_and_wait(a.clone()).await.unwrap();

    assert!(a.has_table("items"));
    assert_eq!(cluster.cluster_size().await, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_new_member_is_copied_from_template() {
    let (cluster, _a) = seeded(3).await;
    let b = Arc::new(MemoryBackend::new("b"));

    assert!(cluster.add_database_and_wait(b.clone()).await.unwrap());

    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Ready);
    assert_eq!(b.rows("items"), rows(3));
    assert_eq!(cluster.cluster_size().await, 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_diverged_member_converges_by_row_count() {
    let (cluster, a) = seeded(3).await;
    let b = Arc::new(MemoryBackend::new("b").with_table(items(), rows(5)).unwrap());

    cluster.add_database_and_wait(b.clone()).await.unwrap();

    assert_eq!(b.rows("items").len(), a.rows("items").len());
    assert_eq!(b.rows("items"), rows(3));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_write_during_synchronization_is_not_lost() {
    let (cluster, a) = seeded(3).await;
    let b = Arc::new(MemoryBackend::new("b"));
    let b_id: BackendId = "b".into();
    b.hold();

    let adding = {
        let cluster = cluster.clone();
        let b = b.clone();
        tokio::spawn(async move { cluster.add_database_and_wait(b).await })
    };
    wait_for_status(&cluster, &b_id, MemberStatus::Processing).await;

    let writing = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.execute_write(&insert(4, "x")).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.queued_writes(&b_id).await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(cluster.status(&b_id).await, MemberStatus::Processing);

    b.release();
    adding.await.unwrap().unwrap();
    writing.await.unwrap().unwrap();

    assert_eq!(cluster.status(&b_id).await, MemberStatus::Ready);
    assert_eq!(a.rows("items").len(), 4);
    assert_eq!(b.rows("items").len(), 4);
    assert_eq!(b.rows("items"), a.rows("items"));
    assert_eq!(cluster.queued_writes(&b_id).await, 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_generated_key_reaches_synchronizing_member() {
    let (cluster, a) = seeded(2).await;
    let b = Arc::new(MemoryBackend::new("b"));
    let b_id: BackendId = "b".into();
    b.hold();

    let adding = {
        let cluster = cluster.clone();
        let b = b.clone();
        tokio::spawn(async move { cluster.add_database_and_wait(b).await })
    };
    wait_for_status(&cluster, &b_id, MemberStatus::Processing).await;

    let writing = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.execute_write(&insert_generated("keyed")).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.queued_writes(&b_id).await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    b.release();
    adding.await.unwrap().unwrap();
    let applied = writing.await.unwrap().unwrap();

    assert!(matches!(
        &applied[0],
        Mutation::Insert { generated_key: None, .. }
    ));
    assert_eq!(a.rows("items").len(), 3);
    assert_eq!(b.rows("items"), a.rows("items"));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_generated_keys_match_on_every_member() {
    let (cluster, a) = seeded(0).await;
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(b.clone()).await.unwrap();

    for name in ["ada", "grace", "barbara"] {
        cluster.execute_write(&insert_generated(name)).await.unwrap();
    }

    assert_eq!(a.rows("items").len(), 3);
    assert_eq!(a.rows("items"), b.rows("items"));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failing_member_is_ejected_from_two() {
    let (cluster, a) = seeded(3).await;
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(b.clone()).await.unwrap();
    b.fail_always("connection reset by peer");

    cluster.execute_write(&insert(4, "x")).await.unwrap();

    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Ejected);
    assert_eq!(cluster.cluster_size().await, 1);
    assert_eq!(a.rows("items").len(), 4);

    let served = a.queries_served();
    for _ in 0..20 {
        let count = cluster.execute_query(&Query::count("items")).await.unwrap();
        assert_eq!(count, vec![vec![Value::Int(4)]]);
    }
    assert_eq!(a.queries_served(), served + 20);
    assert_eq!(b.queries_served(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_last_member_error_is_raised_not_ejected() {
    let (cluster, a) = seeded(1).await;
    a.fail_next(Error::QueryExecution("connection reset by peer".into()));

    let err = cluster.execute_write(&insert(2, "x")).await.unwrap_err();
    assert!(matches!(err, Error::QueryExecution(_)));
    assert_eq!(cluster.status(&"a".into()).await, MemberStatus::Ready);
    assert_eq!(cluster.queued_writes(&"a".into()).await, 0);

    a.fail_next(Error::ConnectionTimeout("a".into()));
    assert!(cluster.execute_query(&Query::scan("items")).await.is_err());
    assert_eq!(cluster.cluster_size().await, 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_application_errors_never_eject() {
    let (cluster, _a) = seeded(1).await;
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(b.clone()).await.unwrap();

    let update = WriteAction::single(Mutation::Update {
        table: "items".into(),
        set_columns: vec!["name".into()],
        set_values: vec![Value::from("renamed")],
        primary_key: PrimaryKey::Int(99),
        key_columns: vec![],
        expected_rows: Some(1),
    });
    assert!(matches!(
        cluster.execute_write(&update).await,
        Err(Error::WrongRowCount { expected: 1, actual: 0 })
    ));

    b.set_in_transaction(true);
    assert!(matches!(
        cluster.execute_write(&insert(2, "y")).await,
        Err(Error::WriteInTransaction)
    ));

    let drop = WriteAction::single(Mutation::DropTable {
        table: "items".into(),
    });
    assert!(matches!(
        cluster.execute_write(&drop).await,
        Err(Error::ProtectedTableDrop(_))
    ));

    assert_eq!(cluster.cluster_size().await, 2);
    assert_eq!(cluster.summary().await.ejected, 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_of_ready_member_is_a_no_op() {
    let (cluster, _a) = seeded(2).await;
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(b.clone()).await.unwrap();
    let writes = b.writes_applied();

    // Racing re-add of a member that is already ready
    assert!(!cluster.add_database(b.clone()).await.unwrap());
    ReconnectProcess::new(Duration::ZERO).run(&cluster).await.unwrap();

    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Ready);
    assert_eq!(b.writes_applied(), writes);
    assert_eq!(b.rows("items"), rows(2));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ejected_member_is_reconnected() {
    let cluster = DatabaseCluster::new(
        vec![items()],
        ClusterOptions {
            scheduler_tick: Duration::from_millis(10),
            reconnect_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );
    let a = Arc::new(MemoryBackend::new("a").with_table(items(), rows(1)).unwrap());
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(a.clone()).await.unwrap();
    cluster.add_database_and_wait(b.clone()).await.unwrap();

    b.fail_always("connection refused");
    cluster.execute_write(&insert(2, "while down")).await.unwrap();
    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Ejected);

    // Still down: reconnection keeps failing and the member stays out
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_ne!(cluster.status(&"b".into()).await, MemberStatus::Ready);

    b.heal();
    wait_for_status(&cluster, &"b".into(), MemberStatus::Ready).await;
    assert_eq!(b.rows("items"), a.rows("items"));
    assert_eq!(b.rows("items").len(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_update_missed_while_ejected_is_replayed() {
    let (cluster, a) = seeded(1).await;
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(b.clone()).await.unwrap();
    assert_eq!(b.rows("items"), rows(1));

    b.fail_always("connection reset");
    let rename = WriteAction::single(Mutation::Update {
        table: "items".into(),
        set_columns: vec!["name".into()],
        set_values: vec![Value::from("renamed")],
        primary_key: PrimaryKey::Int(1),
        key_columns: vec!["id".into()],
        expected_rows: Some(1),
    });
    cluster.execute_write(&rename).await.unwrap();
    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Ejected);
    assert_eq!(cluster.queued_writes(&"b".into()).await, 1);

    // Same row count on both sides: nothing is recopied, the update is replayed
    b.heal();
    cluster.add_database_and_wait(b.clone()).await.unwrap();
    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Ready);
    assert_eq!(a.rows("items"), vec![vec![Value::Int(1), Value::from("renamed")]]);
    assert_eq!(b.rows("items"), a.rows("items"));
    assert_eq!(cluster.queued_writes(&"b".into()).await, 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_retired_member_accumulates_no_writes() {
    let (cluster, a) = seeded(0).await;
    let b = Arc::new(MemoryBackend::new("b"));
    cluster.add_database_and_wait(b.clone()).await.unwrap();

    assert!(cluster.retire_database(&"b".into()).await.unwrap());
    for i in 1..=200 {
        cluster.execute_write(&insert(i, "after retire")).await.unwrap();
    }

    assert_eq!(cluster.status(&"b".into()).await, MemberStatus::Dead);
    assert_eq!(cluster.queued_writes(&"b".into()).await, 0);
    assert_eq!(a.rows("items").len(), 200);
    assert!(b.rows("items").is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_add_is_non_blocking_with_two_ready() {
    let (cluster, a) = seeded(3).await;
    cluster
        .add_database_and_wait(Arc::new(MemoryBackend::new("b")))
        .await
        .unwrap();

    let c = Arc::new(MemoryBackend::new("c"));
    c.hold();
    assert!(cluster.add_database(c.clone()).await.unwrap());
    assert_ne!(cluster.status(&"c".into()).await, MemberStatus::Ready);

    c.release();
    wait_for_status(&cluster, &"c".into(), MemberStatus::Ready).await;
    assert_eq!(c.rows("items"), a.rows("items"));
    assert_eq!(cluster.cluster_size().await, 3);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_writes_reach_every_ready_member() {
    let (cluster, a) = seeded(0).await;
    let others: Vec<Arc<MemoryBackend>> = ["b", "c", "d"]
        .iter()
        .map(|id| Arc::new(MemoryBackend::new(*id)))
        .collect();
    for backend in &others {
        cluster.add_database_and_wait(backend.clone()).await.unwrap();
    }

    let writes: Vec<_> = (1..=10)
        .map(|i| {
            let cluster = cluster.clone();
            tokio::spawn(async move { cluster.execute_write(&insert(i, "x")).await })
        })
        .collect();
    for write in writes {
        write.await.unwrap().unwrap();
    }

    let mut expected = a.rows("items");
    expected.sort_by_key(|r| r[0].as_i64());
    assert_eq!(expected.len(), 10);
    for backend in &others {
        let mut got = backend.rows("items");
        got.sort_by_key(|r| r[0].as_i64());
        assert_eq!(got, expected);
    }
    cluster.shutdown().await;
}
