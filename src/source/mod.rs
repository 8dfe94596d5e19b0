//! Source Adapter (C2) — a polymorphic read interface over each source
//! engine, per spec.md §4.2 and the "Polymorphism over engines" design
//! note in spec.md §9: the scheduler and state machine hold only the
//! [`SourceAdapter`] trait object, never a concrete per-engine type.

pub mod connection_string;
pub mod mariadb;
pub mod mongodb;
pub mod mssql;
pub mod postgres;

use async_trait::async_trait;

use crate::error::RowSyncError;
use crate::value::CellValue;

/// An ordered tuple of typed values drawn from a source table, plus the
/// column names for that table (spec.md §3's Source Row).
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub columns: Vec<String>,
    pub values: Vec<CellValue>,
}

impl SourceRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Extract the composite PK tuple for this row given an ordered list
    /// of PK column names, as plain strings (NULL stays `None`).
    pub fn pk_tuple(&self, pk_columns: &[String]) -> Vec<Option<String>> {
        pk_columns
            .iter()
            .map(|col| match self.get(col) {
                Some(CellValue::Raw(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A candidate primary key, as an ordered list of stringified column
/// values, used for [`SourceAdapter::fetch_pk_existence`].
pub type PkValue = Vec<Option<String>>;

/// Polymorphic capability set implemented once per source engine
/// (spec.md §4.2). Every operation either returns a well-formed result or
/// fails with [`RowSyncError::TransientSource`] /
/// [`RowSyncError::PermanentSource`] — transient driver errors are retried
/// inside the adapter with [`crate::error::RetryPolicy`] before surfacing.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Exact count where cheap; best-effort for document stores.
    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, RowSyncError>;

    /// Rows with ordering key strictly greater than `after_pk` over
    /// `pk_cols`, in lexicographic order, up to `limit` rows. Empty
    /// `after_pk` starts from the minimum. Ordering is total and stable
    /// across calls.
    async fn fetch_by_pk(
        &self,
        schema: &str,
        table: &str,
        pk_cols: &[String],
        after_pk: &[Option<String>],
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError>;

    /// Same as `fetch_by_pk` but ordered by a single column (TEMPORAL_PK).
    async fn fetch_by_column_cursor(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        after_value: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError>;

    /// Used only when no usable ordering key exists; ordering is
    /// unspecified but stable within a cycle.
    async fn fetch_by_offset(
        &self,
        schema: &str,
        table: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError>;

    /// Rows where `time_col > since`, ordered by `time_col` ascending.
    async fn fetch_modified_since(
        &self,
        schema: &str,
        table: &str,
        time_col: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<SourceRow>, RowSyncError>;

    /// The subset of `candidate_pks` present in the source.
    async fn fetch_pk_existence(
        &self,
        schema: &str,
        table: &str,
        pk_cols: &[String],
        candidate_pks: &[PkValue],
    ) -> Result<std::collections::HashSet<PkValue>, RowSyncError>;

    async fn describe_pk(&self, schema: &str, table: &str) -> Result<Vec<String>, RowSyncError>;

    async fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>, RowSyncError>;
}
