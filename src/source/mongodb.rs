//! MongoDB source adapter.
//!
//! `schema_name` maps to a Mongo database, `table_name` to a collection.
//!
//! Resolves the open question in spec.md §9 ("MongoDB cursor"): rather
//! than falling back to `OFFSET` pagination, this adapter paginates over
//! `_id`, which is monotonic per insert batch in MongoDB — Catalog
//! Discovery should assign `pk_strategy = PK`, `pk_columns = ["_id"]` to
//! Mongo tables so `fetch_by_pk` drives the same strictly-greater-than
//! cursor contract the relational adapters use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::{Client, options::FindOptions};
use std::collections::HashSet;

use crate::error::{RetryPolicy, RowSyncError, with_retry};
use crate::source::{PkValue, SourceAdapter, SourceRow};
use crate::value::CellValue;

pub struct MongoAdapter {
    client: Client,
    retry: RetryPolicy,
}

impl MongoAdapter {
    pub async fn connect(connection_string: &str) -> Result<Self, RowSyncError> {
        let client =
            Client::with_uri_str(connection_string)
                .await
                .map_err(|e| RowSyncError::PermanentSource {
                    schema: String::new(),
                    table: String::new(),
                    message: e.to_string(),
                })?;
        Ok(Self {
            client,
            retry: RetryPolicy::default(),
        })
    }

    fn collection(&self, schema: &str, table: &str) -> mongodb::Collection<Document> {
        self.client.database(schema).collection(table)
    }

    fn document_to_row(doc: &Document) -> SourceRow {
        let mut columns = Vec::with_capacity(doc.len());
        let mut values = Vec::with_capacity(doc.len());
        for (key, value) in doc {
            columns.push(key.clone());
            values.push(bson_to_cell(value));
        }
        SourceRow { columns, values }
    }

    /// Parse the `_id` cursor component back into a typed Bson filter
    /// value. MongoDB `_id` is usually an `ObjectId`; fall back to the
    /// raw string for collections using a different `_id` type.
    fn id_bson(raw: &str) -> Bson {
        ObjectId::parse_str(raw)
            .map(Bson::ObjectId)
            .unwrap_or_else(|_| Bson::String(raw.to_string()))
    }

    fn err_transient(schema: &str, table: &str, e: mongodb::error::Error) -> RowSyncError {
        RowSyncError::TransientSource {
            schema: schema.to_string(),
            table: table.to_string(),
            message: e.to_string(),
        }
    }
}

fn bson_to_cell(value: &Bson) -> CellValue {
    match value {
        Bson::Null => CellValue::Null,
        Bson::ObjectId(oid) => CellValue::Raw(oid.to_hex()),
        Bson::String(s) => CellValue::Raw(s.clone()),
        Bson::Boolean(b) => CellValue::Raw(b.to_string()),
        Bson::Int32(n) => CellValue::Raw(n.to_string()),
        Bson::Int64(n) => CellValue::Raw(n.to_string()),
        Bson::Double(n) => CellValue::Raw(n.to_string()),
        Bson::DateTime(dt) => CellValue::Raw(dt.try_to_rfc3339_string().unwrap_or_default()),
        other => CellValue::Raw(other.to_string()),
    }
}

#[async_trait]
impl SourceAdapter for MongoAdapter {
    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, RowSyncError> {
        let coll = self.collection(schema, table);
        with_retry(&self.retry, || async {
            coll.count_documents(doc! {})
                .await
                .map(|n| n as i64)
                .map_err(|e| Self::err_transient(schema, table, e))
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
        let pk_field = pk_cols.first().cloned().unwrap_or_else(|| "_id".to_string());
        let coll = self.collection(schema, table);
        let filter = match after_pk.first() {
            Some(Some(v)) => doc! { &pk_field: { "$gt": Self::id_bson(v) } },
            _ => doc! {},
        };
        let options = FindOptions::builder()
            .sort(doc! { &pk_field: 1 })
            .limit(limit)
            .build();

        with_retry(&self.retry, || async {
            let mut cursor = coll
                .find(filter.clone())
                .with_options(options.clone())
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            let mut out = Vec::new();
            while let Some(doc) = cursor
                .try_next()
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?
            {
                out.push(Self::document_to_row(&doc));
            }
            Ok(out)
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
        let coll = self.collection(schema, table);
        let filter = match after_value {
            Some(v) => doc! { column: { "$gt": Self::id_bson(v) } },
            None => doc! {},
        };
        let options = FindOptions::builder().sort(doc! { column: 1 }).limit(limit).build();

        with_retry(&self.retry, || async {
            let mut cursor = coll
                .find(filter.clone())
                .with_options(options.clone())
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            let mut out = Vec::new();
            while let Some(doc) = cursor
                .try_next()
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?
            {
                out.push(Self::document_to_row(&doc));
            }
            Ok(out)
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
        let coll = self.collection(schema, table);
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .skip(offset as u64)
            .limit(limit)
            .build();

        with_retry(&self.retry, || async {
            let mut cursor = coll
                .find(doc! {})
                .with_options(options.clone())
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            let mut out = Vec::new();
            while let Some(doc) = cursor
                .try_next()
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?
            {
                out.push(Self::document_to_row(&doc));
            }
            Ok(out)
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
        let coll = self.collection(schema, table);
        let since_bson = bson::DateTime::from_system_time(since.into());
        let filter = doc! { time_col: { "$gt": since_bson } };
        let options = FindOptions::builder().sort(doc! { time_col: 1 }).build();

        with_retry(&self.retry, || async {
            let mut cursor = coll
                .find(filter.clone())
                .with_options(options.clone())
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            let mut out = Vec::new();
            while let Some(doc) = cursor
                .try_next()
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?
            {
                out.push(Self::document_to_row(&doc));
            }
            Ok(out)
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
        let pk_field = pk_cols.first().cloned().unwrap_or_else(|| "_id".to_string());
        let ids: Vec<Bson> = candidate_pks
            .iter()
            .filter_map(|pk| pk.first().and_then(|v| v.as_ref()))
            .map(|v| Self::id_bson(v))
            .collect();
        let coll = self.collection(schema, table);
        let filter = doc! { &pk_field: { "$in": ids } };

        with_retry(&self.retry, || async {
            let mut cursor = coll
                .find(filter.clone())
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            let mut found = HashSet::new();
            while let Some(doc) = cursor
                .try_next()
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?
            {
                if let Ok(id) = doc.get_object_id(&pk_field) {
                    found.insert(vec![Some(id.to_hex())]);
                } else if let Some(v) = doc.get(&pk_field) {
                    found.insert(vec![Some(v.to_string())]);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn describe_pk(&self, _schema: &str, _table: &str) -> Result<Vec<String>, RowSyncError> {
        Ok(vec!["_id".to_string()])
    }

    async fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>, RowSyncError> {
        let coll = self.collection(schema, table);
        with_retry(&self.retry, || async {
            let sample = coll
                .find_one(doc! {})
                .await
                .map_err(|e| Self::err_transient(schema, table, e))?;
            Ok(sample
                .map(|d| d.keys().cloned().collect())
                .unwrap_or_default())
        })
        .await
    }
}
