//! Table State Machine (C5) — entry actions for each status (spec.md
//! §4.5). The decision table in [`crate::detector`] already determines
//! which of insert pagination / update scan / delete reconciliation a
//! cycle needs; this module's job is solely the per-status entry action
//! that happens *before* or *after* that detection runs.

use crate::catalog::{CatalogEntry, CatalogStore, ReplicationConfig, TableStatus};
use crate::detector;
use crate::error::RowSyncError;
use crate::source::SourceAdapter;
use crate::target::TargetWriter;

/// Run one scheduler tick for `entry`: apply the current status's entry
/// action, run the Change Detector, and persist the resulting status
/// transition. Returns the status the table is now in.
pub async fn tick(
    catalog: &CatalogStore,
    source: &dyn SourceAdapter,
    target: &TargetWriter,
    entry: &CatalogEntry,
    config: &ReplicationConfig,
) -> Result<TableStatus, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();

    match entry.status {
        TableStatus::Reset => {
            target.truncate_cascade(schema, table).await?;
            catalog.clear_cursor_and_set_full_load(schema, table).await?;
            let refreshed = catalog.get(schema, table).await?;
            complete_cycle(catalog, source, target, &refreshed, config).await
        }
        TableStatus::FullLoad => {
            if is_cursor_zero(entry) {
                target.truncate_cascade(schema, table).await?;
            }
            complete_cycle(catalog, source, target, entry, config).await
        }
        TableStatus::ListeningChanges | TableStatus::PerfectMatch => {
            complete_cycle(catalog, source, target, entry, config).await
        }
        // NO_DATA and ERROR are sticky (spec.md §4.5): no terminal states
        // exist, but nothing other than an operator or Catalog Discovery
        // re-activating the row moves it out of them. The scheduler still
        // observes these tables (ListActive excludes NO_DATA, not ERROR),
        // so an ERROR table is re-probed every cycle in case the
        // underlying condition cleared.
        TableStatus::NoData => Ok(TableStatus::NoData),
        TableStatus::Error => complete_cycle(catalog, source, target, entry, config).await,
    }
}

/// Run the Change Detector for one cycle and persist the resulting status.
///
/// Note on the `PERFECT_MATCH` entry action ("advance `last_processed_pk`
/// to the maximum source key"): whenever `S > T`, [`detector::run_cycle`]'s
/// insert pagination already advances the cursor to each chunk's last row,
/// ending at the true maximum once a short chunk is returned — so by the
/// time a cycle's result is `PERFECT_MATCH`, the cursor is already at the
/// maximum source key with no further action required.
async fn complete_cycle(
    catalog: &CatalogStore,
    source: &dyn SourceAdapter,
    target: &TargetWriter,
    entry: &CatalogEntry,
    config: &ReplicationConfig,
) -> Result<TableStatus, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();

    let result = detector::run_cycle(
        catalog,
        source,
        target,
        entry,
        config.chunk_size,
        config.write_sub_batch_size(),
    )
    .await?;

    catalog
        .update_status(schema, table, result.next_status, None)
        .await?;

    tracing::info!(
        schema,
        table,
        component = "statemachine",
        next_status = result.next_status.as_str(),
        rows_written = result.rows_written,
        rows_deleted = result.rows_deleted,
        "cycle complete"
    );

    Ok(result.next_status)
}

fn is_cursor_zero(entry: &CatalogEntry) -> bool {
    use crate::cursor::PkStrategy;
    match entry.pk_strategy {
        PkStrategy::Offset => entry.last_offset == 0,
        PkStrategy::Pk | PkStrategy::TemporalPk => entry.last_processed_pk_raw.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DbEngine;
    use crate::cursor::PkStrategy;

    fn entry(status: TableStatus, last_offset: i64, last_pk: &str) -> CatalogEntry {
        CatalogEntry {
            schema_name: "sales".into(),
            table_name: "orders".into(),
            cluster_name: "primary".into(),
            db_engine: DbEngine::MariaDb,
            connection_string: "host=localhost;user=u;password=p;db=d".into(),
            active: true,
            status,
            pk_strategy: PkStrategy::Pk,
            pk_columns: vec!["id".into()],
            candidate_columns: vec![],
            last_processed_pk_raw: last_pk.to_string(),
            last_offset,
            last_sync_column: None,
            last_sync_time: None,
        }
    }

    #[test]
    fn cursor_zero_for_fresh_pk_table() {
        assert!(is_cursor_zero(&entry(TableStatus::FullLoad, 0, "")));
        assert!(!is_cursor_zero(&entry(TableStatus::FullLoad, 0, "5")));
    }

    #[test]
    fn cursor_zero_for_fresh_offset_table() {
        let mut e = entry(TableStatus::FullLoad, 0, "");
        e.pk_strategy = PkStrategy::Offset;
        assert!(is_cursor_zero(&e));
        e.last_offset = 10;
        assert!(!is_cursor_zero(&e));
    }
}
