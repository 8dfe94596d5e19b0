//! Target Writer (C3) — applies a Delta Batch to the PostgreSQL target
//! idempotently (spec.md §4.3). Target table and schema names are always
//! lower-cased. The writer opens queries against a shared `PgPool`; each
//! transaction is its own connection checkout so a poisoned transaction on
//! one sub-batch never leaks into the next (spec.md §5).

use sqlx::{PgPool, Row};
use std::collections::HashMap;

use crate::error::RowSyncError;
use crate::source::SourceRow;
use crate::value::{self, CellValue, TypeFamily};

/// What to do with a staged set of rows (spec.md §3's Delta Batch tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Upsert,
    Delete,
}

/// Outcome of one writer call, for observability (spec.md §4.3, §8 S-D).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub rows_written: i64,
    pub rows_skipped: i64,
}

impl WriteOutcome {
    fn combine(self, other: WriteOutcome) -> WriteOutcome {
        WriteOutcome {
            rows_written: self.rows_written + other.rows_written,
            rows_skipped: self.rows_skipped + other.rows_skipped,
        }
    }
}

pub struct TargetWriter {
    pool: PgPool,
}

/// PostgreSQL signals a poisoned transaction with SQLSTATE `25P02`
/// ("in_failed_sql_transaction") when a *later* statement runs after an
/// earlier one in the same transaction already failed. A single
/// multi-row `VALUES` statement that itself violates a constraint never
/// reaches that state — the whole statement fails directly, under its
/// own class-23 SQLSTATE (`check_violation`, `unique_violation`,
/// `not_null_violation`, `foreign_key_violation`). Both are sub-batch
/// failures that must fall back to per-row execution (spec.md §4.3/§8
/// S-D), so both are classified as `AbortedTransaction`.
const ABORTED_TRANSACTION_SQLSTATE: &str = "25P02";
const INTEGRITY_CONSTRAINT_CLASS_PREFIX: &str = "23";

impl TargetWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualify(schema: &str, table: &str) -> String {
        format!(
            "\"{}\".\"{}\"",
            schema.to_lowercase(),
            table.to_lowercase()
        )
    }

    /// Introspect the target's declared column type families, used by
    /// value canonicalization (spec.md §4.3).
    pub async fn column_type_families(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<HashMap<String, TypeFamily>, RowSyncError> {
        let rows = sqlx::query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(schema.to_lowercase())
        .bind(table.to_lowercase())
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::new();
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            map.insert(name, sql_type_to_family(&data_type));
        }
        Ok(map)
    }

    /// The target table's actual primary key columns, in ordinal position —
    /// the authority the change detector uses to decide UPSERT vs. plain
    /// INSERT (spec.md §4.3), distinct from `pk_columns` on the catalog
    /// entry, which names the *source's* pagination key and may be empty
    /// for `TEMPORAL_PK`/`OFFSET` tables even when the target has a PK.
    pub async fn primary_key_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, RowSyncError> {
        let rows = sqlx::query(
            "SELECT kcu.column_name FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
               AND tc.table_schema = $1 AND tc.table_name = $2 \
             ORDER BY kcu.ordinal_position",
        )
        .bind(schema.to_lowercase())
        .bind(table.to_lowercase())
        .fetch_all(&self.pool)
        .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(row.try_get("column_name")?);
        }
        Ok(columns)
    }

    /// Whether the target table exists (used by the change detector's
    /// `S = 0 ∧ T = 0` / `T > 0` distinction — see spec.md §4.4).
    pub async fn table_exists(&self, schema: &str, table: &str) -> Result<bool, RowSyncError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(schema.to_lowercase())
        .bind(table.to_lowercase())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn row_count(&self, schema: &str, table: &str) -> Result<i64, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {qualified}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// `TRUNCATE ... CASCADE` — the RESET/FULL_LOAD entry action
    /// (spec.md §4.5).
    pub async fn truncate_cascade(&self, schema: &str, table: &str) -> Result<(), RowSyncError> {
        let qualified = Self::qualify(schema, table);
        sqlx::query(&format!("TRUNCATE TABLE {qualified} CASCADE"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bulk UPSERT: `INSERT ... ON CONFLICT (pk) DO UPDATE SET col =
    /// EXCLUDED.col`, sub-batched, with per-row fallback on an aborted
    /// transaction (spec.md §4.3).
    pub async fn upsert(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        rows: &[SourceRow],
        sub_batch_size: i64,
    ) -> Result<WriteOutcome, RowSyncError> {
        if rows.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let types = self.column_type_families(schema, table).await?;
        let columns = &rows[0].columns;

        let mut outcome = WriteOutcome::default();
        for chunk in rows.chunks(sub_batch_size.max(1) as usize) {
            match self
                .upsert_sub_batch(schema, table, pk_columns, columns, chunk, &types)
                .await
            {
                Ok(written) => {
                    outcome = outcome.combine(WriteOutcome {
                        rows_written: written,
                        rows_skipped: 0,
                    });
                }
                Err(e) if is_aborted_transaction(&e) => {
                    let fallback = self
                        .upsert_rows_individually(schema, table, pk_columns, columns, chunk, &types)
                        .await?;
                    outcome = outcome.combine(fallback);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    async fn upsert_sub_batch(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        columns: &[String],
        rows: &[SourceRow],
        types: &HashMap<String, TypeFamily>,
    ) -> Result<i64, RowSyncError> {
        let sql = build_upsert_sql(schema, table, pk_columns, columns, rows, types);
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL statement_timeout = 600000")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(&sql).execute(&mut *tx).await.map_err(|e| {
            to_target_error(schema, table, e)
        })?;
        tx.commit().await?;
        Ok(result.rows_affected() as i64)
    }

    async fn upsert_rows_individually(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        columns: &[String],
        rows: &[SourceRow],
        types: &HashMap<String, TypeFamily>,
    ) -> Result<WriteOutcome, RowSyncError> {
        let mut outcome = WriteOutcome::default();
        for row in rows {
            let sql = build_upsert_sql(schema, table, pk_columns, columns, std::slice::from_ref(row), types);
            let mut tx = self.pool.begin().await?;
            match sqlx::query(&sql).execute(&mut *tx).await {
                Ok(_) => {
                    tx.commit().await?;
                    outcome.rows_written += 1;
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    tracing::warn!(
                        schema, table, error = %e, "row rejected by target, skipping"
                    );
                    outcome.rows_skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Bulk INSERT (no PK): same sub-batch shape, no `ON CONFLICT`, no
    /// row-level fallback — failures propagate (spec.md §4.3).
    pub async fn insert(
        &self,
        schema: &str,
        table: &str,
        rows: &[SourceRow],
        sub_batch_size: i64,
    ) -> Result<WriteOutcome, RowSyncError> {
        if rows.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let types = self.column_type_families(schema, table).await?;
        let columns = &rows[0].columns;

        let mut outcome = WriteOutcome::default();
        for chunk in rows.chunks(sub_batch_size.max(1) as usize) {
            let sql = build_insert_sql(schema, table, columns, chunk, &types);
            let mut tx = self.pool.begin().await?;
            sqlx::query("SET LOCAL statement_timeout = 600000")
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| to_target_error(schema, table, e))?;
            tx.commit().await?;
            outcome.rows_written += result.rows_affected() as i64;
        }
        Ok(outcome)
    }

    /// Bulk DELETE: `WHERE (pk = v1) OR (pk = v2) ...`, sub-batched.
    /// Returns the affected row count.
    pub async fn delete(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        pk_values: &[Vec<Option<String>>],
        sub_batch_size: i64,
    ) -> Result<u64, RowSyncError> {
        if pk_values.is_empty() {
            return Ok(0);
        }
        let qualified = Self::qualify(schema, table);
        let mut total = 0u64;
        for chunk in pk_values.chunks(sub_batch_size.max(1) as usize) {
            let predicate = chunk
                .iter()
                .map(|pk| {
                    let clauses = pk_columns
                        .iter()
                        .zip(pk.iter())
                        .map(|(col, val)| match val {
                            Some(v) => format!("\"{col}\" = '{}'", v.replace('\'', "''")),
                            None => format!("\"{col}\" IS NULL"),
                        })
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    format!("({clauses})")
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            let sql = format!("DELETE FROM {qualified} WHERE {predicate}");
            let result = sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| to_target_error(schema, table, e))?;
            total += result.rows_affected();
        }
        Ok(total)
    }

    /// Single-row UPDATE for the update-scan path (spec.md §4.4): used
    /// when a cell-by-cell compare finds a difference.
    pub async fn update_row(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        row: &SourceRow,
        types: &HashMap<String, TypeFamily>,
    ) -> Result<(), RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let set_clause = row
            .columns
            .iter()
            .zip(row.values.iter())
            .filter(|(c, _)| !pk_columns.contains(c))
            .map(|(c, v)| {
                let family = types.get(c).copied().unwrap_or(TypeFamily::Text);
                format!(
                    "\"{c}\" = '{}'",
                    value::canonicalize(v, family).replace('\'', "''")
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let pk_tuple = row.pk_tuple(pk_columns);
        let where_clause = pk_columns
            .iter()
            .zip(pk_tuple.iter())
            .map(|(col, val)| match val {
                Some(v) => format!("\"{col}\" = '{}'", v.replace('\'', "''")),
                None => format!("\"{col}\" IS NULL"),
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("UPDATE {qualified} SET {set_clause} WHERE {where_clause}");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| to_target_error(schema, table, e))?;
        Ok(())
    }

    /// Fetch one page of target primary keys, ordered by `pk_columns`, for
    /// delete reconciliation's OFFSET walk over the target (spec.md §4.4).
    pub async fn fetch_pk_page(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Vec<Option<String>>>, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let col_list = pk_columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {col_list} FROM {qualified} ORDER BY {col_list} OFFSET {offset} LIMIT {limit}"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| to_target_error(schema, table, e))?;
        Ok(rows
            .iter()
            .map(pg_row_to_source_row)
            .map(|r| r.pk_tuple(pk_columns))
            .collect())
    }

    /// Fetch one row of the target by PK, for the update scan's
    /// cell-by-cell compare.
    pub async fn fetch_target_row(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        pk_value: &[Option<String>],
    ) -> Result<Option<SourceRow>, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let where_clause = pk_columns
            .iter()
            .zip(pk_value.iter())
            .map(|(col, val)| match val {
                Some(v) => format!("\"{col}\" = '{}'", v.replace('\'', "''")),
                None => format!("\"{col}\" IS NULL"),
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("SELECT * FROM {qualified} WHERE {where_clause} LIMIT 1");
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| pg_row_to_source_row(&r)))
    }
}

fn sql_type_to_family(data_type: &str) -> TypeFamily {
    match data_type {
        "integer" | "smallint" | "bigint" => TypeFamily::Integer,
        "numeric" | "real" | "double precision" => TypeFamily::Numeric,
        "boolean" => TypeFamily::Boolean,
        "timestamp without time zone" | "timestamp with time zone" => TypeFamily::Timestamp,
        "date" => TypeFamily::Date,
        "time without time zone" | "time with time zone" => TypeFamily::Time,
        _ => TypeFamily::Text,
    }
}

fn build_upsert_sql(
    schema: &str,
    table: &str,
    pk_columns: &[String],
    columns: &[String],
    rows: &[SourceRow],
    types: &HashMap<String, TypeFamily>,
) -> String {
    let qualified = format!(
        "\"{}\".\"{}\"",
        schema.to_lowercase(),
        table.to_lowercase()
    );
    let col_list = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let values = rows
        .iter()
        .map(|row| render_values_tuple(row, types))
        .collect::<Vec<_>>()
        .join(", ");
    let pk_list = pk_columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let update_set = columns
        .iter()
        .filter(|c| !pk_columns.contains(c))
        .map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");

    // `upsert` is only ever called with the target's actual PK columns
    // (see `TargetWriter::primary_key_columns`), so `pk_columns` is never
    // empty here; a table whose only columns are its PK has nothing left
    // to update on conflict, hence `DO NOTHING` rather than `DO UPDATE`.
    if update_set.is_empty() {
        format!("INSERT INTO {qualified} ({col_list}) VALUES {values} ON CONFLICT ({pk_list}) DO NOTHING")
    } else {
        format!(
            "INSERT INTO {qualified} ({col_list}) VALUES {values} \
             ON CONFLICT ({pk_list}) DO UPDATE SET {update_set}"
        )
    }
}

fn build_insert_sql(
    schema: &str,
    table: &str,
    columns: &[String],
    rows: &[SourceRow],
    types: &HashMap<String, TypeFamily>,
) -> String {
    let qualified = format!(
        "\"{}\".\"{}\"",
        schema.to_lowercase(),
        table.to_lowercase()
    );
    let col_list = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let values = rows
        .iter()
        .map(|row| render_values_tuple(row, types))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {qualified} ({col_list}) VALUES {values}")
}

fn render_values_tuple(row: &SourceRow, types: &HashMap<String, TypeFamily>) -> String {
    let rendered = row
        .columns
        .iter()
        .zip(row.values.iter())
        .map(|(col, val)| {
            let family = types.get(col).copied().unwrap_or(TypeFamily::Text);
            let canon = value::canonicalize(val, family);
            if matches!(
                family,
                TypeFamily::Integer | TypeFamily::Numeric | TypeFamily::Boolean
            ) && canon != "DEFAULT"
            {
                canon
            } else if canon == "DEFAULT" {
                canon
            } else {
                format!("'{}'", canon.replace('\'', "''"))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("({rendered})")
}

fn pg_row_to_source_row(row: &sqlx::postgres::PgRow) -> SourceRow {
    use sqlx::{Column, TypeInfo};
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for col in row.columns() {
        columns.push(col.name().to_string());
        let value: Option<String> = match col.type_info().name() {
            "INT2" | "INT4" | "INT8" => row
                .try_get::<Option<i64>, _>(col.ordinal())
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            "FLOAT4" | "FLOAT8" | "NUMERIC" => row
                .try_get::<Option<f64>, _>(col.ordinal())
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            "BOOL" => row
                .try_get::<Option<bool>, _>(col.ordinal())
                .ok()
                .flatten()
                .map(|v| v.to_string()),
            _ => row
                .try_get::<Option<String>, _>(col.ordinal())
                .ok()
                .flatten(),
        };
        values.push(match value {
            Some(s) => CellValue::Raw(s),
            None => CellValue::Null,
        });
    }
    SourceRow { columns, values }
}

fn is_aborted_transaction(e: &RowSyncError) -> bool {
    matches!(e, RowSyncError::AbortedTransaction { .. })
}

fn to_target_error(schema: &str, table: &str, e: sqlx::Error) -> RowSyncError {
    if let sqlx::Error::Database(db_err) = &e {
        let code = db_err.code();
        let is_poisoned = code.as_deref() == Some(ABORTED_TRANSACTION_SQLSTATE)
            || code
                .as_deref()
                .is_some_and(|c| c.starts_with(INTEGRITY_CONSTRAINT_CLASS_PREFIX));
        if is_poisoned {
            return RowSyncError::AbortedTransaction {
                schema: schema.to_string(),
                table: table.to_string(),
                message: db_err.message().to_string(),
            };
        }
    }
    RowSyncError::TransientTarget {
        schema: schema.to_string(),
        table: table.to_string(),
        message: e.to_string(),
    }
}
