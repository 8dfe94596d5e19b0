//! End-to-end scenario tests (spec.md §8, S-A through S-F) driven against
//! a real target PostgreSQL (via Testcontainers) and an in-memory source
//! adapter, exercising the full Catalog → Detector → State Machine path.

mod common;

use chrono::{DateTime, Utc};
use common::TestDb;
use common::fake_source::{FakeSourceAdapter, row};
use rowsync::catalog::{CatalogStore, ReplicationConfig, TableStatus};
use rowsync::statemachine;
use rowsync::target::TargetWriter;
use sqlx::PgPool;

async fn seed_catalog(
    pool: &PgPool,
    schema: &str,
    table: &str,
    status: &str,
    pk_strategy: &str,
    pk_columns: &[&str],
    last_processed_pk: &str,
    last_offset: i64,
    last_sync_column: Option<&str>,
    last_sync_time: Option<DateTime<Utc>>,
) {
    sqlx::query(
        r#"INSERT INTO metadata.catalog
             (schema_name, table_name, cluster_name, db_engine, connection_string,
              active, status, pk_strategy, pk_columns, candidate_columns,
              last_processed_pk, last_offset, last_sync_column, last_sync_time)
           VALUES ($1, $2, 'primary', 'MariaDB', 'host=x;user=u;password=p;db=d',
                   true, $3, $4, $5, '[]', $6, $7, $8, $9)"#,
    )
    .bind(schema)
    .bind(table)
    .bind(status)
    .bind(pk_strategy)
    .bind(serde_json::to_value(pk_columns).unwrap())
    .bind(last_processed_pk)
    .bind(last_offset)
    .bind(last_sync_column)
    .bind(last_sync_time)
    .execute(pool)
    .await
    .expect("seed catalog row");
}

fn config(chunk_size: i64) -> ReplicationConfig {
    ReplicationConfig {
        chunk_size,
        sync_interval_secs: 10,
        debug_level: rowsync::catalog::DebugLevel::Info,
    }
}

#[tokio::test]
async fn s_a_cold_full_load_single_column_pk() {
    let db = TestDb::with_catalog().await;
    db.execute("CREATE SCHEMA sales").await;
    db.execute("CREATE TABLE sales.orders (id INTEGER PRIMARY KEY, name TEXT)").await;
    seed_catalog(&db.pool, "sales", "orders", "FULL_LOAD", "PK", &["id"], "", 0, None, None).await;

    let rows: Vec<_> = (1..=5000)
        .map(|i| row(&["id", "name"], &[&i.to_string(), "widget"]))
        .collect();
    let source = FakeSourceAdapter::new(rows);
    let catalog = CatalogStore::new(db.pool.clone());
    let target = TargetWriter::new(db.pool.clone());
    let entry = catalog.get("sales", "orders").await.unwrap();

    let status = statemachine::tick(&catalog, &source, &target, &entry, &config(1000))
        .await
        .unwrap();

    assert_eq!(status, TableStatus::PerfectMatch);
    assert_eq!(db.count("sales.orders").await, 5000);
    let final_entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(final_entry.last_processed_pk_raw, "5000");
}

#[tokio::test]
async fn s_b_composite_pk_pagination_no_skips_no_duplicates() {
    let db = TestDb::with_catalog().await;
    db.execute("CREATE SCHEMA sales").await;
    db.execute(
        "CREATE TABLE sales.orders (tenant_id TEXT, order_id INTEGER, PRIMARY KEY (tenant_id, order_id))",
    )
    .await;
    seed_catalog(
        &db.pool,
        "sales",
        "orders",
        "FULL_LOAD",
        "PK",
        &["tenant_id", "order_id"],
        "",
        0,
        None,
        None,
    )
    .await;

    let rows = vec![
        row(&["tenant_id", "order_id"], &["A", "1"]),
        row(&["tenant_id", "order_id"], &["A", "2"]),
        row(&["tenant_id", "order_id"], &["B", "1"]),
    ];
    let source = FakeSourceAdapter::new(rows);
    let catalog = CatalogStore::new(db.pool.clone());
    let target = TargetWriter::new(db.pool.clone());
    let entry = catalog.get("sales", "orders").await.unwrap();

    let status = statemachine::tick(&catalog, &source, &target, &entry, &config(2))
        .await
        .unwrap();

    assert_eq!(status, TableStatus::PerfectMatch);
    assert_eq!(db.count("sales.orders").await, 3);
    let final_entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(final_entry.last_processed_pk_raw, "B|1");
}

#[tokio::test]
async fn s_c_delete_detection() {
    let db = TestDb::with_catalog().await;
    db.execute("CREATE SCHEMA sales").await;
    db.execute("CREATE TABLE sales.orders (id INTEGER PRIMARY KEY)").await;
    for id in 1..=100 {
        db.execute(&format!("INSERT INTO sales.orders (id) VALUES ({id})")).await;
    }
    seed_catalog(
        &db.pool,
        "sales",
        "orders",
        "PERFECT_MATCH",
        "PK",
        &["id"],
        "100",
        100,
        None,
        None,
    )
    .await;

    let rows: Vec<_> = (1..=100)
        .filter(|&i| i != 81)
        .map(|i| row(&["id"], &[&i.to_string()]))
        .collect();
    let source = FakeSourceAdapter::new(rows);
    let catalog = CatalogStore::new(db.pool.clone());
    let target = TargetWriter::new(db.pool.clone());
    let entry = catalog.get("sales", "orders").await.unwrap();

    statemachine::tick(&catalog, &source, &target, &entry, &config(1000))
        .await
        .unwrap();

    assert_eq!(db.count("sales.orders").await, 99);
    let still_there: i64 = db.query_scalar("SELECT count(*) FROM sales.orders WHERE id = 81").await;
    assert_eq!(still_there, 0);
}

#[tokio::test]
async fn s_d_poisoned_upsert_row_falls_back_per_row() {
    let db = TestDb::with_catalog().await;
    db.execute("CREATE SCHEMA sales").await;
    db.execute(
        "CREATE TABLE sales.orders (id INTEGER PRIMARY KEY, amount INTEGER CHECK (amount >= 0))",
    )
    .await;
    seed_catalog(&db.pool, "sales", "orders", "FULL_LOAD", "PK", &["id"], "", 0, None, None).await;

    let rows: Vec<_> = (1..=10)
        .map(|i| {
            let amount = if i == 7 { "-1".to_string() } else { "10".to_string() };
            row(&["id", "amount"], &[&i.to_string(), &amount])
        })
        .collect();
    let source = FakeSourceAdapter::new(rows);
    let catalog = CatalogStore::new(db.pool.clone());
    let target = TargetWriter::new(db.pool.clone());
    let entry = catalog.get("sales", "orders").await.unwrap();

    statemachine::tick(&catalog, &source, &target, &entry, &config(1000))
        .await
        .unwrap();

    assert_eq!(db.count("sales.orders").await, 9);
    let row7: i64 = db.query_scalar("SELECT count(*) FROM sales.orders WHERE id = 7").await;
    assert_eq!(row7, 0);
    let final_entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(final_entry.last_processed_pk_raw, "10");
}

#[tokio::test]
async fn s_e_update_via_time_column_then_converges_to_no_writes() {
    let db = TestDb::with_catalog().await;
    db.execute("CREATE SCHEMA sales").await;
    db.execute(
        "CREATE TABLE sales.orders (id INTEGER PRIMARY KEY, name TEXT, updated_at TIMESTAMPTZ)",
    )
    .await;
    db.execute(
        "INSERT INTO sales.orders (id, name, updated_at) VALUES (42, 'old', '2024-01-01T00:00:00Z')",
    )
    .await;

    let t0: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
    seed_catalog(
        &db.pool,
        "sales",
        "orders",
        "LISTENING_CHANGES",
        "PK",
        &["id"],
        "42",
        1,
        Some("updated_at"),
        Some(t0),
    )
    .await;

    let source = FakeSourceAdapter::new(vec![row(
        &["id", "name", "updated_at"],
        &["42", "new", "2024-06-01T00:00:00Z"],
    )]);
    let catalog = CatalogStore::new(db.pool.clone());
    let target = TargetWriter::new(db.pool.clone());

    let entry = catalog.get("sales", "orders").await.unwrap();
    statemachine::tick(&catalog, &source, &target, &entry, &config(1000))
        .await
        .unwrap();

    let name: String = db.query_scalar("SELECT name FROM sales.orders WHERE id = 42").await;
    assert_eq!(name, "new");

    // Re-running with no further source changes must be a no-op.
    let entry2 = catalog.get("sales", "orders").await.unwrap();
    assert!(entry2.last_sync_time.unwrap() > t0);
    db.execute("UPDATE sales.orders SET name = 'sentinel' WHERE id = 42").await;
    statemachine::tick(&catalog, &source, &target, &entry2, &config(1000))
        .await
        .unwrap();
    let name_after: String = db.query_scalar("SELECT name FROM sales.orders WHERE id = 42").await;
    assert_eq!(name_after, "sentinel", "second cycle must not rewrite an unmodified source row");
}

#[tokio::test]
async fn s_f_reset_truncates_and_reseeds_immediately() {
    let db = TestDb::with_catalog().await;
    db.execute("CREATE SCHEMA sales").await;
    db.execute("CREATE TABLE sales.orders (id INTEGER PRIMARY KEY)").await;
    for id in 1..=10 {
        db.execute(&format!("INSERT INTO sales.orders (id) VALUES ({id})")).await;
    }
    seed_catalog(&db.pool, "sales", "orders", "RESET", "PK", &["id"], "10", 10, None, None).await;

    let rows: Vec<_> = (100..=103).map(|i| row(&["id"], &[&i.to_string()])).collect();
    let source = FakeSourceAdapter::new(rows);
    let catalog = CatalogStore::new(db.pool.clone());
    let target = TargetWriter::new(db.pool.clone());
    let entry = catalog.get("sales", "orders").await.unwrap();

    let status = statemachine::tick(&catalog, &source, &target, &entry, &config(1000))
        .await
        .unwrap();

    assert_eq!(status, TableStatus::PerfectMatch);
    assert_eq!(db.count("sales.orders").await, 4);
    let old_row: i64 = db.query_scalar("SELECT count(*) FROM sales.orders WHERE id = 5").await;
    assert_eq!(old_row, 0);
}
