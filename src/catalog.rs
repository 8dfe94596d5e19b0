//! Catalog layer — durable per-table registry of identity, progress
//! cursors, and status.
//!
//! Backed by `metadata.catalog` and `metadata.config` inside the target
//! PostgreSQL (spec.md §4.1, §6). The store is a thin typed wrapper over
//! `sqlx::PgPool`; every write here is a single-row `UPDATE`/`INSERT` and
//! is individually atomic, matching spec.md §4.1's consistency contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::Row;

use crate::cursor::{Cursor, PkStrategy, decode_pk, encode_pk};
use crate::error::RowSyncError;

/// `db_engine` values understood by the core. Catalog Discovery is free to
/// add engines the core has no adapter for; such rows are simply never
/// claimed by a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DbEngine {
    MariaDb,
    Mssql,
    PostgreSql,
    MongoDb,
}

impl DbEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEngine::MariaDb => "MariaDB",
            DbEngine::Mssql => "MSSQL",
            DbEngine::PostgreSql => "PostgreSQL",
            DbEngine::MongoDb => "MongoDB",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, RowSyncError> {
        match s {
            "MariaDB" => Ok(DbEngine::MariaDb),
            "MSSQL" => Ok(DbEngine::Mssql),
            "PostgreSQL" => Ok(DbEngine::PostgreSql),
            "MongoDB" => Ok(DbEngine::MongoDb),
            other => Err(RowSyncError::CatalogDecode(format!(
                "unknown db_engine: {other}"
            ))),
        }
    }
}

/// `status` values of spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    FullLoad,
    ListeningChanges,
    PerfectMatch,
    Reset,
    NoData,
    Error,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::FullLoad => "FULL_LOAD",
            TableStatus::ListeningChanges => "LISTENING_CHANGES",
            TableStatus::PerfectMatch => "PERFECT_MATCH",
            TableStatus::Reset => "RESET",
            TableStatus::NoData => "NO_DATA",
            TableStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, RowSyncError> {
        match s {
            "FULL_LOAD" => Ok(TableStatus::FullLoad),
            "LISTENING_CHANGES" => Ok(TableStatus::ListeningChanges),
            "PERFECT_MATCH" => Ok(TableStatus::PerfectMatch),
            "RESET" => Ok(TableStatus::Reset),
            "NO_DATA" => Ok(TableStatus::NoData),
            "ERROR" => Ok(TableStatus::Error),
            other => Err(RowSyncError::CatalogDecode(format!(
                "unknown status: {other}"
            ))),
        }
    }

    /// Scheduler dispatch priority, highest first. Ties are broken by
    /// `(schema_name, table_name)` — see SPEC_FULL.md's "Status-priority
    /// sort" note, supplemented from `original_source/`.
    pub fn priority(&self) -> u8 {
        match self {
            TableStatus::FullLoad => 0,
            TableStatus::Reset => 1,
            TableStatus::PerfectMatch => 2,
            TableStatus::ListeningChanges => 3,
            TableStatus::NoData | TableStatus::Error => 4,
        }
    }
}

/// One row per (schema, table) pair the system is aware of (spec.md §3).
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub schema_name: String,
    pub table_name: String,
    pub cluster_name: String,
    pub db_engine: DbEngine,
    pub connection_string: String,
    pub active: bool,
    pub status: TableStatus,
    pub pk_strategy: PkStrategy,
    pub pk_columns: Vec<String>,
    pub candidate_columns: Vec<String>,
    pub last_processed_pk_raw: String,
    pub last_offset: i64,
    pub last_sync_column: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    /// The in-memory cursor, selected by `pk_strategy` (catalog invariant 1).
    pub fn cursor(&self) -> Cursor {
        match self.pk_strategy {
            PkStrategy::Offset => Cursor::Offset(self.last_offset.max(0) as u64),
            PkStrategy::Pk | PkStrategy::TemporalPk => {
                Cursor::Composite(decode_pk(&self.last_processed_pk_raw))
            }
        }
    }
}

/// Runtime-tunable options read from `metadata.config` (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
    pub chunk_size: i64,
    pub sync_interval_secs: u64,
    pub debug_level: DebugLevel,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            sync_interval_secs: 10,
            debug_level: DebugLevel::Info,
        }
    }
}

impl ReplicationConfig {
    /// Write sub-batch size: `min(chunk_size / 2, 500)` (spec.md §4.3).
    pub fn write_sub_batch_size(&self) -> i64 {
        (self.chunk_size / 2).min(500).max(1)
    }
}

/// Ordered so that `DEBUG < INFO < WARNING < ERROR < CRITICAL`, matching
/// the ordering shown in `original_source/`'s logger (see SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl DebugLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => DebugLevel::Debug,
            "WARNING" => DebugLevel::Warning,
            "ERROR" => DebugLevel::Error,
            "CRITICAL" => DebugLevel::Critical,
            _ => DebugLevel::Info,
        }
    }
}

/// Durable catalog store, one per `Runtime` (spec.md §9 "no global
/// singletons" — this is constructed explicitly and passed by reference).
pub struct CatalogStore {
    pool: PgPool,
}

impl CatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `ListActive(engine)` — spec.md §4.1: active, matching engine,
    /// excluding `NO_DATA`, ordered deterministically.
    pub async fn list_active(&self, engine: DbEngine) -> Result<Vec<CatalogEntry>, RowSyncError> {
        let rows = sqlx::query(
            r#"SELECT schema_name, table_name, cluster_name, db_engine, connection_string,
                      active, status, pk_strategy, pk_columns, candidate_columns,
                      last_processed_pk, last_offset, last_sync_column, last_sync_time
               FROM metadata.catalog
               WHERE active = true AND db_engine = $1 AND status != 'NO_DATA'
               ORDER BY schema_name, table_name"#,
        )
        .bind(engine.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    /// `Get(schema, table)`.
    pub async fn get(&self, schema: &str, table: &str) -> Result<CatalogEntry, RowSyncError> {
        let row = sqlx::query(
            r#"SELECT schema_name, table_name, cluster_name, db_engine, connection_string,
                      active, status, pk_strategy, pk_columns, candidate_columns,
                      last_processed_pk, last_offset, last_sync_column, last_sync_time
               FROM metadata.catalog
               WHERE schema_name = $1 AND table_name = $2"#,
        )
        .bind(schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RowSyncError::NotFound(schema.to_string(), table.to_string()))?;

        Self::decode_row(&row)
    }

    /// `UpdateStatus(schema, table, status, count)` — spec.md §4.1.
    ///
    /// When `count` is provided and `status` is one of FULL_LOAD/RESET/
    /// LISTENING_CHANGES, also writes `last_offset = count`. When
    /// `last_sync_column` is set and the target table exists, refreshes
    /// `last_sync_time` to `MAX(last_sync_column)` from the target;
    /// otherwise to "now".
    pub async fn update_status(
        &self,
        schema: &str,
        table: &str,
        status: TableStatus,
        count: Option<i64>,
    ) -> Result<(), RowSyncError> {
        let entry = self.get(schema, table).await?;

        let writes_offset = matches!(
            status,
            TableStatus::FullLoad | TableStatus::Reset | TableStatus::ListeningChanges
        );

        let mut tx = self.pool.begin().await?;

        if writes_offset {
            if let Some(n) = count {
                sqlx::query(
                    "UPDATE metadata.catalog SET status = $1, last_offset = $2 \
                     WHERE schema_name = $3 AND table_name = $4",
                )
                .bind(status.as_str())
                .bind(n)
                .bind(schema)
                .bind(table)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE metadata.catalog SET status = $1 \
                     WHERE schema_name = $2 AND table_name = $3",
                )
                .bind(status.as_str())
                .bind(schema)
                .bind(table)
                .execute(&mut *tx)
                .await?;
            }
        } else {
            sqlx::query(
                "UPDATE metadata.catalog SET status = $1 \
                 WHERE schema_name = $2 AND table_name = $3",
            )
            .bind(status.as_str())
            .bind(schema)
            .bind(table)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(sync_col) = entry.last_sync_column.as_deref() {
            let target_table = format!(
                "\"{}\".\"{}\"",
                schema.to_lowercase(),
                table.to_lowercase()
            );
            let max_sync_time: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
                "SELECT MAX(\"{sync_col}\") FROM {target_table}",
            ))
            .fetch_one(&mut *tx)
            .await
            .unwrap_or(None);

            let new_sync_time = max_sync_time.unwrap_or_else(Utc::now);
            sqlx::query(
                "UPDATE metadata.catalog SET last_sync_time = $1 \
                 WHERE schema_name = $2 AND table_name = $3",
            )
            .bind(new_sync_time)
            .bind(schema)
            .bind(table)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// `UpdateLastProcessedPK(schema, table, pk)` — refuses to move the
    /// cursor backwards (catalog invariant 2 / `CursorInvariantError`).
    pub async fn update_last_processed_pk(
        &self,
        schema: &str,
        table: &str,
        pk: &[Option<String>],
    ) -> Result<(), RowSyncError> {
        let entry = self.get(schema, table).await?;
        let current = decode_pk(&entry.last_processed_pk_raw);
        let new_cursor = Cursor::Composite(pk.to_vec());
        if !new_cursor.is_at_least(&Cursor::Composite(current)) {
            return Err(RowSyncError::CursorInvariant {
                schema: schema.to_string(),
                table: table.to_string(),
                message: "last_processed_pk would move backwards".to_string(),
            });
        }

        sqlx::query(
            "UPDATE metadata.catalog SET last_processed_pk = $1 \
             WHERE schema_name = $2 AND table_name = $3",
        )
        .bind(encode_pk(pk))
        .bind(schema)
        .bind(table)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `UpdateLastOffset(schema, table, n)` — only legal when
    /// `pk_strategy = OFFSET`.
    pub async fn update_last_offset(
        &self,
        schema: &str,
        table: &str,
        n: i64,
    ) -> Result<(), RowSyncError> {
        let entry = self.get(schema, table).await?;
        if entry.pk_strategy != PkStrategy::Offset {
            return Err(RowSyncError::InvalidArgument(format!(
                "UpdateLastOffset called on {schema}.{table} whose pk_strategy is {:?}",
                entry.pk_strategy
            )));
        }
        if n < entry.last_offset {
            return Err(RowSyncError::CursorInvariant {
                schema: schema.to_string(),
                table: table.to_string(),
                message: "last_offset would move backwards".to_string(),
            });
        }

        sqlx::query(
            "UPDATE metadata.catalog SET last_offset = $1 \
             WHERE schema_name = $2 AND table_name = $3",
        )
        .bind(n)
        .bind(schema)
        .bind(table)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear the cursor and set `status = FULL_LOAD` — the RESET entry
    /// action's catalog half (spec.md §4.5); truncating the target table
    /// is the state machine's job, not the catalog's.
    pub async fn clear_cursor_and_set_full_load(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<(), RowSyncError> {
        sqlx::query(
            "UPDATE metadata.catalog \
             SET status = 'FULL_LOAD', last_offset = 0, last_processed_pk = '' \
             WHERE schema_name = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert (or update on conflict) a catalog entry. The write surface
    /// the external Catalog Discovery collaborator is assumed to call
    /// (SPEC_FULL.md §4.1).
    pub async fn upsert_entry(&self, entry: &NewCatalogEntry) -> Result<(), RowSyncError> {
        sqlx::query(
            r#"INSERT INTO metadata.catalog
                 (schema_name, table_name, cluster_name, db_engine, connection_string,
                  active, status, pk_strategy, pk_columns, candidate_columns,
                  last_processed_pk, last_offset, last_sync_column)
               VALUES ($1, $2, $3, $4, $5, true, 'FULL_LOAD', $6, $7, $8, '', 0, $9)
               ON CONFLICT (schema_name, table_name) DO UPDATE SET
                 cluster_name = EXCLUDED.cluster_name,
                 db_engine = EXCLUDED.db_engine,
                 connection_string = EXCLUDED.connection_string,
                 active = true,
                 pk_strategy = EXCLUDED.pk_strategy,
                 pk_columns = EXCLUDED.pk_columns,
                 candidate_columns = EXCLUDED.candidate_columns,
                 last_sync_column = EXCLUDED.last_sync_column"#,
        )
        .bind(&entry.schema_name)
        .bind(&entry.table_name)
        .bind(&entry.cluster_name)
        .bind(entry.db_engine.as_str())
        .bind(&entry.connection_string)
        .bind(entry.pk_strategy.as_str())
        .bind(serde_json::to_value(&entry.pk_columns).unwrap())
        .bind(serde_json::to_value(&entry.candidate_columns).unwrap())
        .bind(&entry.last_sync_column)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag a row inactive; it is forgotten by the next maintenance pass's
    /// `vacuum_deactivated` (spec.md §4.6).
    pub async fn deactivate(&self, schema: &str, table: &str) -> Result<(), RowSyncError> {
        sqlx::query(
            "UPDATE metadata.catalog SET active = false \
             WHERE schema_name = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete rows where `active = false`. Run from the scheduler's
    /// 2-minute maintenance pass.
    pub async fn vacuum_deactivated(&self) -> Result<u64, RowSyncError> {
        let result = sqlx::query("DELETE FROM metadata.catalog WHERE active = false")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Read `metadata.config`, falling back to defaults for missing keys.
    pub async fn load_config(&self) -> Result<ReplicationConfig, RowSyncError> {
        let rows = sqlx::query("SELECT key, value FROM metadata.config")
            .fetch_all(&self.pool)
            .await?;

        let mut config = ReplicationConfig::default();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            match key.as_str() {
                "chunk_size" => {
                    if let Ok(n) = value.parse() {
                        config.chunk_size = n;
                    }
                }
                "sync_interval" => {
                    if let Ok(n) = value.parse() {
                        config.sync_interval_secs = n;
                    }
                }
                "debug_level" => config.debug_level = DebugLevel::from_str(&value),
                _ => {}
            }
        }
        Ok(config)
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<CatalogEntry, RowSyncError> {
        let pk_columns_json: serde_json::Value = row.try_get("pk_columns")?;
        let candidate_columns_json: serde_json::Value = row.try_get("candidate_columns")?;

        Ok(CatalogEntry {
            schema_name: row.try_get("schema_name")?,
            table_name: row.try_get("table_name")?,
            cluster_name: row.try_get("cluster_name")?,
            db_engine: DbEngine::from_str(row.try_get("db_engine")?)?,
            connection_string: row.try_get("connection_string")?,
            active: row.try_get("active")?,
            status: TableStatus::from_str(row.try_get("status")?)?,
            pk_strategy: PkStrategy::from_str(row.try_get("pk_strategy")?)?,
            pk_columns: serde_json::from_value(pk_columns_json).unwrap_or_default(),
            candidate_columns: serde_json::from_value(candidate_columns_json).unwrap_or_default(),
            last_processed_pk_raw: row.try_get("last_processed_pk")?,
            last_offset: row.try_get::<Option<i64>, _>("last_offset")?.unwrap_or(0),
            last_sync_column: row.try_get("last_sync_column")?,
            last_sync_time: row.try_get("last_sync_time")?,
        })
    }
}

/// Fields needed to register a new catalog entry (Catalog Discovery's
/// write surface).
pub struct NewCatalogEntry {
    pub schema_name: String,
    pub table_name: String,
    pub cluster_name: String,
    pub db_engine: DbEngine,
    pub connection_string: String,
    pub pk_strategy: PkStrategy,
    pub pk_columns: Vec<String>,
    pub candidate_columns: Vec<String>,
    pub last_sync_column: Option<String>,
}
