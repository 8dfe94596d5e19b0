//! An in-memory [`SourceAdapter`] for driving the Change Detector and
//! Table State Machine against a controlled source, without standing up a
//! real MariaDB/MSSQL/MongoDB instance for every scenario test.

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rowsync::error::RowSyncError;
use rowsync::source::{PkValue, SourceAdapter, SourceRow};
use rowsync::value::CellValue;
use tokio::sync::Mutex;

pub struct FakeSourceAdapter {
    rows: Mutex<Vec<SourceRow>>,
}

impl FakeSourceAdapter {
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self { rows: Mutex::new(rows) }
    }

    pub async fn delete_where(&self, pk_cols: &[String], pk: &[Option<String>]) {
        let mut rows = self.rows.lock().await;
        rows.retain(|r| r.pk_tuple(pk_cols) != pk);
    }

    pub async fn set_cell(&self, pk_cols: &[String], pk: &[Option<String>], column: &str, value: &str) {
        let mut rows = self.rows.lock().await;
        for row in rows.iter_mut() {
            if row.pk_tuple(pk_cols) == pk {
                if let Some(idx) = row.columns.iter().position(|c| c == column) {
                    row.values[idx] = CellValue::Raw(value.to_string());
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

fn cmp_component(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        },
    }
}

fn cmp_tuple(a: &[Option<String>], b: &[Option<String>]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let c = cmp_component(x, y);
        if c != Ordering::Equal {
            return c;
        }
    }
    a.len().cmp(&b.len())
}

#[async_trait]
impl SourceAdapter for FakeSourceAdapter {
    async fn count_rows(&self, _schema: &str, _table: &str) -> Result<i64, RowSyncError> {
        Ok(self.rows.lock().await.len() as i64)
    }

    async fn fetch_by_pk(
        &self,
        _schema: &str,
        _table: &str,
        pk_cols: &[String],
        after_pk: &[Option<String>],
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let rows = self.rows.lock().await;
        let mut matching: Vec<SourceRow> = rows
            .iter()
            .filter(|r| after_pk.is_empty() || cmp_tuple(&r.pk_tuple(pk_cols), after_pk) == Ordering::Greater)
            .cloned()
            .collect();
        matching.sort_by(|a, b| cmp_tuple(&a.pk_tuple(pk_cols), &b.pk_tuple(pk_cols)));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn fetch_by_column_cursor(
        &self,
        _schema: &str,
        _table: &str,
        column: &str,
        after_value: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let rows = self.rows.lock().await;
        let after = after_value.map(|s| s.to_string());
        let mut matching: Vec<SourceRow> = rows
            .iter()
            .filter(|r| match (&after, r.get(column)) {
                (None, _) => true,
                (Some(a), Some(CellValue::Raw(v))) => cmp_component(&Some(v.clone()), &Some(a.clone())) == Ordering::Greater,
                _ => false,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            let av = a.get(column).cloned();
            let bv = b.get(column).cloned();
            match (av, bv) {
                (Some(CellValue::Raw(x)), Some(CellValue::Raw(y))) => cmp_component(&Some(x), &Some(y)),
                _ => Ordering::Equal,
            }
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn fetch_by_offset(
        &self,
        _schema: &str,
        _table: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn fetch_modified_since(
        &self,
        _schema: &str,
        _table: &str,
        time_col: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceRow>, RowSyncError> {
        let rows = self.rows.lock().await;
        let mut matching: Vec<SourceRow> = rows
            .iter()
            .filter(|r| match r.get(time_col) {
                Some(CellValue::Raw(v)) => DateTime::parse_from_rfc3339(v)
                    .map(|t| t.with_timezone(&Utc) > since)
                    .unwrap_or(false),
                _ => false,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            let (Some(CellValue::Raw(x)), Some(CellValue::Raw(y))) = (a.get(time_col), b.get(time_col)) else {
                return Ordering::Equal;
            };
            x.cmp(y)
        });
        Ok(matching)
    }

    async fn fetch_pk_existence(
        &self,
        _schema: &str,
        _table: &str,
        pk_cols: &[String],
        candidate_pks: &[PkValue],
    ) -> Result<HashSet<PkValue>, RowSyncError> {
        let rows = self.rows.lock().await;
        let existing: HashSet<PkValue> = rows.iter().map(|r| r.pk_tuple(pk_cols)).collect();
        Ok(candidate_pks.iter().filter(|pk| existing.contains(*pk)).cloned().collect())
    }

    async fn describe_pk(&self, _schema: &str, _table: &str) -> Result<Vec<String>, RowSyncError> {
        Ok(Vec::new())
    }

    async fn column_names(&self, _schema: &str, _table: &str) -> Result<Vec<String>, RowSyncError> {
        let rows = self.rows.lock().await;
        Ok(rows.first().map(|r| r.columns.clone()).unwrap_or_default())
    }
}

pub fn row(columns: &[&str], values: &[&str]) -> SourceRow {
    SourceRow {
        columns: columns.iter().map(|s| s.to_string()).collect(),
        values: values.iter().map(|v| CellValue::Raw(v.to_string())).collect(),
    }
}
