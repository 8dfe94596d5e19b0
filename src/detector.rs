//! Change Detector (C4) — given a catalog entry, compares source and target
//! and drives one cycle's worth of inserts/updates/deletes (spec.md §4.4).
//!
//! The decision table dispatches on `(S, T)` — source and target row
//! counts — and the presence of a configured `last_sync_column`. Each arm
//! below both performs the write(s) and returns the status the table
//! should transition to; [`crate::statemachine`] applies that transition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::catalog::{CatalogEntry, CatalogStore, TableStatus};
use crate::cursor::{Cursor, PkStrategy};
use crate::error::RowSyncError;
use crate::source::{SourceAdapter, SourceRow};
use crate::target::TargetWriter;
use crate::value::{self, TypeFamily};

/// Per-table pass guard: wall clock (spec.md §4.4).
const MAX_PASS_DURATION: Duration = Duration::from_secs(2 * 60 * 60);
/// Per-table pass guard: chunk count (spec.md §4.4).
const MAX_CHUNKS: u32 = 10_000;

/// Result of running one table's detection-and-transfer cycle.
pub struct CycleResult {
    pub next_status: TableStatus,
    pub rows_written: i64,
    pub rows_deleted: u64,
}

/// Run one cycle for `entry` and return the status it should move to.
///
/// This is the Change Detector's top-level entry point: it evaluates the
/// decision table of spec.md §4.4 and performs whichever of insert
/// pagination, delete reconciliation, and update scan the table's current
/// counts call for.
pub async fn run_cycle(
    catalog: &CatalogStore,
    source: &dyn SourceAdapter,
    target: &TargetWriter,
    entry: &CatalogEntry,
    chunk_size: i64,
    sub_batch_size: i64,
) -> Result<CycleResult, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();

    let s = source.count_rows(schema, table).await?;
    let target_exists = target.table_exists(schema, table).await?;
    let mut t = if target_exists {
        target.row_count(schema, table).await?
    } else {
        0
    };

    if s == 0 && t == 0 {
        return Ok(CycleResult {
            next_status: TableStatus::NoData,
            rows_written: 0,
            rows_deleted: 0,
        });
    }
    if s == 0 && t > 0 {
        return Ok(CycleResult {
            next_status: TableStatus::Error,
            rows_written: 0,
            rows_deleted: 0,
        });
    }

    let mut rows_written = 0i64;
    let mut rows_deleted = 0u64;

    if s < t {
        rows_deleted = delete_reconciliation(source, target, entry, chunk_size).await?;
        t = target.row_count(schema, table).await?;
    }

    if s > t {
        rows_written = insert_pagination(catalog, source, target, entry, chunk_size, sub_batch_size).await?;
        t = target.row_count(schema, table).await?;
    }

    if let Some(sync_col) = entry.last_sync_column.as_deref() {
        let updated = update_scan(source, target, entry, sync_col).await?;
        rows_written += updated;
    }

    let latest = catalog.get(schema, table).await?;
    let next_status = if s == t && latest.last_offset >= s {
        TableStatus::PerfectMatch
    } else {
        TableStatus::ListeningChanges
    };

    Ok(CycleResult {
        next_status,
        rows_written,
        rows_deleted,
    })
}

/// Insert pagination: page through source rows not yet written, writing
/// each chunk via UPSERT and advancing the cursor (spec.md §4.4).
async fn insert_pagination(
    catalog: &CatalogStore,
    source: &dyn SourceAdapter,
    target: &TargetWriter,
    entry: &CatalogEntry,
    chunk_size: i64,
    sub_batch_size: i64,
) -> Result<i64, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();
    let started = Instant::now();
    let mut chunks = 0u32;
    let mut total_written: i64 = entry.last_offset;
    let mut cursor = entry.cursor();
    let target_pk = target.primary_key_columns(schema, table).await?;

    loop {
        if started.elapsed() > MAX_PASS_DURATION || chunks >= MAX_CHUNKS {
            tracing::warn!(
                schema,
                table,
                chunks,
                elapsed_secs = started.elapsed().as_secs(),
                "insert pagination budget exceeded, ending pass with progress committed"
            );
            break;
        }

        let rows = fetch_next_chunk(source, entry, &cursor, chunk_size).await?;
        if rows.is_empty() {
            break;
        }
        let short_chunk = (rows.len() as i64) < chunk_size;

        // spec.md §4.3: UPSERT when the target has a PK (the common case,
        // and the only one with a row-level fallback on a poisoned
        // sub-batch); plain INSERT with no fallback when it doesn't.
        let outcome = if target_pk.is_empty() {
            target.insert(schema, table, &rows, sub_batch_size).await?
        } else {
            target.upsert(schema, table, &target_pk, &rows, sub_batch_size).await?
        };
        total_written += outcome.rows_written;
        chunks += 1;

        match entry.pk_strategy {
            PkStrategy::Pk | PkStrategy::TemporalPk => {
                let last_row = rows.last().expect("rows is non-empty");
                let pk = last_row.pk_tuple(&entry.pk_columns);
                catalog.update_last_processed_pk(schema, table, &pk).await?;
                cursor = Cursor::Composite(pk);
            }
            PkStrategy::Offset => {
                let new_offset = entry.last_offset + rows.len() as i64;
                catalog.update_last_offset(schema, table, new_offset).await?;
                cursor = Cursor::Offset(new_offset.max(0) as u64);
            }
        }
        catalog
            .update_status(schema, table, TableStatus::ListeningChanges, Some(total_written))
            .await?;

        if short_chunk {
            break;
        }
    }

    Ok(total_written - entry.last_offset)
}

async fn fetch_next_chunk(
    source: &dyn SourceAdapter,
    entry: &CatalogEntry,
    cursor: &Cursor,
    chunk_size: i64,
) -> Result<Vec<SourceRow>, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();
    match entry.pk_strategy {
        PkStrategy::Pk => {
            let after = match cursor {
                Cursor::Composite(c) => c.clone(),
                _ => Vec::new(),
            };
            source
                .fetch_by_pk(schema, table, &entry.pk_columns, &after, chunk_size)
                .await
        }
        PkStrategy::TemporalPk => {
            let after = match cursor {
                Cursor::Composite(c) => c.first().cloned().flatten(),
                _ => None,
            };
            let column = entry
                .pk_columns
                .first()
                .map(String::as_str)
                .unwrap_or_default();
            source
                .fetch_by_column_cursor(schema, table, column, after.as_deref(), chunk_size)
                .await
        }
        PkStrategy::Offset => {
            let offset = match cursor {
                Cursor::Offset(n) => *n as i64,
                _ => 0,
            };
            source.fetch_by_offset(schema, table, offset, chunk_size).await
        }
    }
}

/// Delete reconciliation: walk target PKs via OFFSET, probe source
/// existence, delete PKs absent from source (spec.md §4.4).
async fn delete_reconciliation(
    source: &dyn SourceAdapter,
    target: &TargetWriter,
    entry: &CatalogEntry,
    chunk_size: i64,
) -> Result<u64, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();
    let mut offset = 0i64;
    let mut total_deleted = 0u64;

    loop {
        let page = target
            .fetch_pk_page(schema, table, &entry.pk_columns, offset, chunk_size)
            .await?;
        if page.is_empty() {
            break;
        }
        let short_page = (page.len() as i64) < chunk_size;

        let present = source
            .fetch_pk_existence(schema, table, &entry.pk_columns, &page)
            .await?;
        let missing: Vec<_> = page.into_iter().filter(|pk| !present.contains(pk)).collect();

        if !missing.is_empty() {
            let deleted = target
                .delete(schema, table, &entry.pk_columns, &missing, chunk_size)
                .await?;
            total_deleted += deleted;
            // Deleting shrinks the target, so the next page starts from the
            // same offset rather than skipping rows that shifted down.
        } else {
            offset += chunk_size;
        }

        if short_page {
            break;
        }
    }

    Ok(total_deleted)
}

/// Update scan: for each row modified since `last_sync_time`, compare
/// cell-by-cell against the target and UPDATE on any difference (spec.md
/// §4.4). `last_sync_time` itself is advanced by
/// [`CatalogStore::update_status`]'s `MAX(last_sync_column)` refresh.
async fn update_scan(
    source: &dyn SourceAdapter,
    target: &TargetWriter,
    entry: &CatalogEntry,
    sync_column: &str,
) -> Result<i64, RowSyncError> {
    let schema = entry.schema_name.as_str();
    let table = entry.table_name.as_str();
    let since = entry
        .last_sync_time
        .unwrap_or_else(|| chrono::DateTime::from_timestamp(0, 0).unwrap());

    let modified = source
        .fetch_modified_since(schema, table, sync_column, since)
        .await?;
    if modified.is_empty() {
        return Ok(0);
    }

    let types = target.column_type_families(schema, table).await?;
    let mut updated = 0i64;

    for row in &modified {
        let pk = row.pk_tuple(&entry.pk_columns);
        if pk.iter().any(Option::is_none) {
            continue;
        }
        let Some(existing) = target
            .fetch_target_row(schema, table, &entry.pk_columns, &pk)
            .await?
        else {
            continue;
        };
        if row_differs(row, &existing, &types) {
            target.update_row(schema, table, &entry.pk_columns, row, &types).await?;
            updated += 1;
        }
    }

    Ok(updated)
}

fn row_differs(source_row: &SourceRow, target_row: &SourceRow, types: &HashMap<String, TypeFamily>) -> bool {
    for col in &source_row.columns {
        let family = types.get(col).copied().unwrap_or(TypeFamily::Text);
        let source_val = source_row.get(col).map(|v| value::canonicalize(v, family));
        let target_val = target_row.get(col).map(|v| value::canonicalize(v, family));
        if source_val != target_val {
            return true;
        }
    }
    false
}
