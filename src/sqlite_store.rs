//! SQLite-backed [`Store`] implementation.
//!
//! Records are stored as one JSON document per row, keyed by collection and
//! kept in insertion order. Rows also carry the record's source id, so a
//! query pinned to one source reads only that source's rows. Filtering,
//! projection and aggregation then run in process through [`query_eval`],
//! so results match every other backend.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use etl_harness_core::schema::SourceSchema;
use etl_harness_core::router::SOURCE_FIELD;
use etl_harness_core::store::query_eval::{self, CompiledFilter};
use etl_harness_core::store::{
    filter_source_scope, new_object_id, pipeline_source_scope, CommitOutcome, QueryEvent, Store,
    UploadEvent, ID_FIELD, OID_KEY,
};
use etl_harness_core::Record;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Documents of a collection in insertion order, restricted to one
    /// source when `source_id` is given.
    async fn collection_docs(
        &self,
        collection: &str,
        source_id: Option<&str>,
    ) -> Result<Vec<Record>> {
        let bodies: Vec<String> = match source_id {
            Some(source_id) => {
                sqlx::query_scalar(
                    "SELECT body_json FROM records WHERE collection = ? AND source_id = ? ORDER BY seq",
                )
                .bind(collection)
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT body_json FROM records WHERE collection = ? ORDER BY seq",
                )
                .bind(collection)
                .fetch_all(&self.pool)
                .await?
            }
        };
        bodies.iter().map(|b| decode(b)).collect()
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).with_context(|| "Corrupt JSON document in database")
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_many(&self, collection: &str, records: Vec<Record>) -> Result<usize> {
        let count = records.len();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let oid = new_object_id();
            let id = oid[OID_KEY].as_str().unwrap_or_default().to_string();
            let mut doc = Record::new();
            doc.insert(ID_FIELD.to_string(), oid);
            doc.extend(record.into_iter().filter(|(k, _)| k != ID_FIELD));
            let source_id = doc.get(SOURCE_FIELD).and_then(Value::as_str);

            sqlx::query(
                "INSERT INTO records (id, collection, source_id, body_json) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(collection)
            .bind(source_id)
            .bind(encode(&doc)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Record,
        projection: &Record,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let compiled = CompiledFilter::new(filter)?;
        let docs = self
            .collection_docs(collection, filter_source_scope(filter))
            .await?;
        let mut out = Vec::new();
        for doc in docs {
            if out.len() >= limit {
                break;
            }
            if compiled.matches(&doc)? {
                out.push(query_eval::project(&doc, projection)?);
            }
        }
        Ok(out)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Value],
        limit: usize,
    ) -> Result<Vec<Record>> {
        let docs = self
            .collection_docs(collection, pipeline_source_scope(pipeline))
            .await?;
        let mut out = query_eval::run_pipeline(docs, pipeline)?;
        out.truncate(limit);
        Ok(out)
    }

    async fn read_schema(&self, source_id: &str) -> Result<Option<SourceSchema>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body_json FROM schemas WHERE source_id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
        body.as_deref().map(decode).transpose()
    }

    async fn commit_schema(
        &self,
        schema: &SourceSchema,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome> {
        let body = encode(schema)?;
        let version = schema.version as i64;
        let mut tx = self.pool.begin().await?;

        // The guarded write comes first so the transaction holds the write
        // lock before anything else is decided.
        let written = match expected_version {
            None => sqlx::query(
                "INSERT INTO schemas (source_id, version, body_json) VALUES (?, ?, ?)
                 ON CONFLICT(source_id) DO NOTHING",
            )
            .bind(&schema.source_id)
            .bind(version)
            .bind(&body)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(expected) => sqlx::query(
                "UPDATE schemas SET version = ?, body_json = ? WHERE source_id = ? AND version = ?",
            )
            .bind(version)
            .bind(&body)
            .bind(&schema.source_id)
            .bind(expected as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if written == 0 {
            let found: Option<i64> =
                sqlx::query_scalar("SELECT version FROM schemas WHERE source_id = ?")
                    .bind(&schema.source_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(CommitOutcome::VersionConflict {
                found: found.map(|v| v as u64),
            });
        }

        sqlx::query("INSERT INTO schema_history (source_id, version, body_json) VALUES (?, ?, ?)")
            .bind(&schema.source_id)
            .bind(version)
            .bind(&body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn schema_history(&self, source_id: &str) -> Result<Vec<SourceSchema>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body_json FROM schema_history WHERE source_id = ? ORDER BY version",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        bodies.iter().map(|b| decode(b)).collect()
    }

    async fn log_upload(&self, event: &UploadEvent) -> Result<()> {
        sqlx::query("INSERT INTO uploads (source_id, uploaded_at, body_json) VALUES (?, ?, ?)")
            .bind(&event.source_id)
            .bind(event.uploaded_at.to_rfc3339())
            .bind(encode(event)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn uploads(&self, source_id: &str) -> Result<Vec<UploadEvent>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body_json FROM uploads WHERE source_id = ? ORDER BY seq DESC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        bodies.iter().map(|b| decode(b)).collect()
    }

    async fn log_query(&self, event: &QueryEvent) -> Result<()> {
        sqlx::query("INSERT INTO queries (source_id, executed_at, body_json) VALUES (?, ?, ?)")
            .bind(&event.source_id)
            .bind(event.executed_at.to_rfc3339())
            .bind(encode(event)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn queries(&self, source_id: &str) -> Result<Vec<QueryEvent>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body_json FROM queries WHERE source_id = ? ORDER BY seq DESC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        bodies.iter().map(|b| decode(b)).collect()
    }
}
