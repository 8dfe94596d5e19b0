//! Integration tests for `CatalogStore` against a real PostgreSQL catalog
//! schema (spec.md §4.1, catalog invariants in §4.5/§7).

mod common;

use common::TestDb;
use rowsync::catalog::{CatalogStore, DbEngine, NewCatalogEntry, TableStatus};
use rowsync::cursor::PkStrategy;

fn new_entry(schema: &str, table: &str) -> NewCatalogEntry {
    NewCatalogEntry {
        schema_name: schema.into(),
        table_name: table.into(),
        cluster_name: "primary".into(),
        db_engine: DbEngine::MariaDb,
        connection_string: "host=x;user=u;password=p;db=d".into(),
        pk_strategy: PkStrategy::Pk,
        pk_columns: vec!["id".into()],
        candidate_columns: vec![],
        last_sync_column: None,
    }
}

#[tokio::test]
async fn upsert_entry_then_get_round_trips() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();

    let entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(entry.status, TableStatus::FullLoad);
    assert_eq!(entry.pk_columns, vec!["id".to_string()]);
    assert!(entry.active);
}

#[tokio::test]
async fn upsert_entry_is_idempotent_and_preserves_progress() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();
    catalog
        .update_last_processed_pk("sales", "orders", &[Some("42".into())])
        .await
        .unwrap();

    // Re-discovering the same table must not reset progress already made.
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();
    let entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(entry.last_processed_pk_raw, "42");
}

#[tokio::test]
async fn update_last_processed_pk_refuses_to_move_backwards() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();
    catalog
        .update_last_processed_pk("sales", "orders", &[Some("100".into())])
        .await
        .unwrap();

    let result = catalog
        .update_last_processed_pk("sales", "orders", &[Some("50".into())])
        .await;
    assert!(result.is_err());
    let entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(entry.last_processed_pk_raw, "100");
}

#[tokio::test]
async fn update_last_offset_refuses_to_move_backwards_and_requires_offset_strategy() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    let mut entry = new_entry("sales", "orders");
    entry.pk_strategy = PkStrategy::Offset;
    catalog.upsert_entry(&entry).await.unwrap();

    catalog.update_last_offset("sales", "orders", 100).await.unwrap();
    assert!(catalog.update_last_offset("sales", "orders", 50).await.is_err());

    let pk_entry = new_entry("sales", "customers");
    catalog.upsert_entry(&pk_entry).await.unwrap();
    assert!(catalog.update_last_offset("sales", "customers", 1).await.is_err());
}

#[tokio::test]
async fn update_last_processed_pk_accepts_integer_pk_crossing_a_power_of_ten() {
    // Lexicographically "18" < "9", but a single-column integer PK cursor
    // must treat 9 -> 18 as forward progress, not a backwards move.
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();
    catalog
        .update_last_processed_pk("sales", "orders", &[Some("9".into())])
        .await
        .unwrap();

    catalog
        .update_last_processed_pk("sales", "orders", &[Some("18".into())])
        .await
        .unwrap();

    let entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(entry.last_processed_pk_raw, "18");
}

#[tokio::test]
async fn list_active_excludes_inactive_no_data_and_other_engines() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();

    let mut other_engine = new_entry("sales", "customers");
    other_engine.db_engine = DbEngine::PostgreSql;
    catalog.upsert_entry(&other_engine).await.unwrap();

    catalog.upsert_entry(&new_entry("sales", "inactive")).await.unwrap();
    catalog.deactivate("sales", "inactive").await.unwrap();

    catalog.upsert_entry(&new_entry("sales", "empty")).await.unwrap();
    catalog.update_status("sales", "empty", TableStatus::NoData, None).await.unwrap();

    let active = catalog.list_active(DbEngine::MariaDb).await.unwrap();
    let names: Vec<&str> = active.iter().map(|e| e.table_name.as_str()).collect();
    assert_eq!(names, vec!["orders"]);
}

#[tokio::test]
async fn clear_cursor_and_set_full_load_resets_progress() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();
    catalog
        .update_last_processed_pk("sales", "orders", &[Some("999".into())])
        .await
        .unwrap();
    catalog.update_status("sales", "orders", TableStatus::Reset, None).await.unwrap();

    catalog.clear_cursor_and_set_full_load("sales", "orders").await.unwrap();
    let entry = catalog.get("sales", "orders").await.unwrap();
    assert_eq!(entry.status, TableStatus::FullLoad);
    assert_eq!(entry.last_processed_pk_raw, "");
    assert_eq!(entry.last_offset, 0);
}

#[tokio::test]
async fn vacuum_deactivated_removes_only_inactive_rows() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    catalog.upsert_entry(&new_entry("sales", "orders")).await.unwrap();
    catalog.upsert_entry(&new_entry("sales", "stale")).await.unwrap();
    catalog.deactivate("sales", "stale").await.unwrap();

    let removed = catalog.vacuum_deactivated().await.unwrap();
    assert_eq!(removed, 1);
    assert!(catalog.get("sales", "orders").await.is_ok());
    assert!(catalog.get("sales", "stale").await.is_err());
}

#[tokio::test]
async fn load_config_falls_back_to_defaults_when_unset() {
    let db = TestDb::with_catalog().await;
    let catalog = CatalogStore::new(db.pool.clone());
    let config = catalog.load_config().await.unwrap();
    assert_eq!(config.chunk_size, 1000);
    assert_eq!(config.sync_interval_secs, 10);
}

#[tokio::test]
async fn load_config_honors_overrides_in_metadata_config() {
    let db = TestDb::with_catalog().await;
    db.execute("INSERT INTO metadata.config (key, value) VALUES ('chunk_size', '250')").await;
    db.execute("INSERT INTO metadata.config (key, value) VALUES ('sync_interval', '5')").await;
    db.execute("INSERT INTO metadata.config (key, value) VALUES ('debug_level', 'WARNING')").await;

    let catalog = CatalogStore::new(db.pool.clone());
    let config = catalog.load_config().await.unwrap();
    assert_eq!(config.chunk_size, 250);
    assert_eq!(config.sync_interval_secs, 5);
    assert_eq!(config.write_sub_batch_size(), 125);
}
