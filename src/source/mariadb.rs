//! MariaDB/MySQL source adapter.
//!
//! Connects via `sqlx::MySqlPool`. Session timeouts are applied right
//! after connecting — `wait_timeout`, `net_read_timeout`,
//! `net_write_timeout` at 600s (spec.md §5), matching the original
//! `getMariaDBConnection`'s immediate post-connect `SET SESSION` (see
//! SPEC_FULL.md).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{RetryPolicy, RowSyncError, with_retry};
use crate::source::connection_string::ConnectionParams;
use crate::source::{PkValue, SourceAdapter, SourceRow};
use crate::value::CellValue;

pub struct MariaDbAdapter {
    pool: MySqlPool,
    retry: RetryPolicy,
}

impl MariaDbAdapter {
    pub async fn connect(connection_string: &str) -> Result<Self, RowSyncError> {
        let params = ConnectionParams::parse(connection_string);
        let host = params.get_or("host", "localhost");
        let user = params.get_or("user", "");
        let password = params.get_or("password", "");
        let db = params.get_or("db", "");
        let port = params.get_or("port", "3306");

        let url = format!("mysql://{user}:{password}@{host}:{port}/{db}");

        let pool = MySqlPoolOptions::new()
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query(
                        "SET SESSION wait_timeout = 600, net_read_timeout = 600, \
                         net_write_timeout = 600",
                    )
                    .execute(conn)
                    .await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .map_err(|e| RowSyncError::PermanentSource {
                schema: schema_hint(&db),
                table: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self {
            pool,
            retry: RetryPolicy::default(),
        })
    }

    fn err_transient(schema: &str, table: &str, e: sqlx::Error) -> RowSyncError {
        RowSyncError::TransientSource {
            schema: schema.to_string(),
            table: table.to_string(),
            message: e.to_string(),
        }
    }

    fn row_to_source_row(row: &MySqlRow) -> SourceRow {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for col in row.columns() {
            columns.push(col.name().to_string());
            let value: Option<String> = match col.type_info().name() {
                "TINYINT" | "SMALLINT" | "INT" | "BIGINT" | "MEDIUMINT" => {
                    row.try_get::<Option<i64>, _>(col.ordinal())
                        .ok()
                        .flatten()
                        .map(|v| v.to_string())
                }
                "FLOAT" | "DOUBLE" | "DECIMAL" => row
                    .try_get::<Option<f64>, _>(col.ordinal())
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

    fn qualify(schema: &str, table: &str) -> String {
        format!("`{schema}`.`{table}`")
    }
}

fn schema_hint(db: &str) -> String {
    db.to_string()
}

#[async_trait]
impl SourceAdapter for MariaDbAdapter {
    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        with_retry(&self.retry, || async {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {qualified}"))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(count)
        })
        .await
    }

    async fn fetch_by_pk(
        &self,
        schema: &str,
        table: &str,
        pk_cols: &[String],
        after_pk: &[Option<String>],
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let order_by = pk_cols
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");

        let where_clause = if after_pk.is_empty() || after_pk.iter().all(|v| v.is_none()) {
            String::new()
        } else {
            let tuple_cols = pk_cols
                .iter()
                .map(|c| format!("`{c}`"))
                .collect::<Vec<_>>()
                .join(", ");
            let tuple_vals = after_pk
                .iter()
                .map(|v| match v {
                    Some(s) => format!("'{}'", s.replace('\'', "''")),
                    None => "NULL".to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("WHERE ({tuple_cols}) > ({tuple_vals})")
        };

        let sql =
            format!("SELECT * FROM {qualified} {where_clause} ORDER BY {order_by} LIMIT {limit}");

        with_retry(&self.retry, || async {
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(rows.iter().map(Self::row_to_source_row).collect())
        })
        .await
    }

    async fn fetch_by_column_cursor(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        after_value: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let where_clause = match after_value {
            Some(v) => format!("WHERE `{column}` > '{}'", v.replace('\'', "''")),
            None => String::new(),
        };
        let sql = format!(
            "SELECT * FROM {qualified} {where_clause} ORDER BY `{column}` LIMIT {limit}"
        );

        with_retry(&self.retry, || async {
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(rows.iter().map(Self::row_to_source_row).collect())
        })
        .await
    }

    async fn fetch_by_offset(
        &self,
        schema: &str,
        table: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let sql = format!("SELECT * FROM {qualified} LIMIT {limit} OFFSET {offset}");

        with_retry(&self.retry, || async {
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(rows.iter().map(Self::row_to_source_row).collect())
        })
        .await
    }

    async fn fetch_modified_since(
        &self,
        schema: &str,
        table: &str,
        time_col: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let qualified = Self::qualify(schema, table);
        let sql = format!(
            "SELECT * FROM {qualified} WHERE `{time_col}` > ? ORDER BY `{time_col}` ASC"
        );

        with_retry(&self.retry, || async {
            let rows = sqlx::query(&sql)
                .bind(since.naive_utc())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(rows.iter().map(Self::row_to_source_row).collect())
        })
        .await
    }

    async fn fetch_pk_existence(
        &self,
        schema: &str,
        table: &str,
        pk_cols: &[String],
        candidate_pks: &[PkValue],
    ) -> Result<HashSet<PkValue>, RowSyncError> {
        if candidate_pks.is_empty() {
            return Ok(HashSet::new());
        }
        let qualified = Self::qualify(schema, table);
        let predicate = candidate_pks
            .iter()
            .map(|pk| {
                let clauses = pk_cols
                    .iter()
                    .zip(pk.iter())
                    .map(|(col, val)| match val {
                        Some(v) => format!("`{col}` = '{}'", v.replace('\'', "''")),
                        None => format!("`{col}` IS NULL"),
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!("({clauses})")
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let select_cols = pk_cols
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select_cols} FROM {qualified} WHERE {predicate}");

        with_retry(&self.retry, || async {
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            let mut found = HashSet::new();
            for row in rows {
                let mut pk = Vec::new();
                for col in pk_cols {
                    let v: Option<String> = row.try_get(col.as_str()).unwrap_or(None);
                    pk.push(v);
                }
                found.insert(pk);
            }
            Ok(found)
        })
        .await
    }

    async fn describe_pk(&self, schema: &str, table: &str) -> Result<Vec<String>, RowSyncError> {
        with_retry(&self.retry, || async {
            let rows = sqlx::query(
                "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
            )
            .bind(schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(rows
                .into_iter()
                .map(|r| r.try_get::<String, _>(0).unwrap_or_default())
                .collect())
        })
        .await
    }

    async fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>, RowSyncError> {
        with_retry(&self.retry, || async {
            let rows = sqlx::query(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            )
            .bind(schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(rows
                .into_iter()
                .map(|r| r.try_get::<String, _>(0).unwrap_or_default())
                .collect())
        })
        .await
    }
}
