//! Storage abstraction for the ETL pipeline.
//!
//! The [`Store`] trait is the document-database collaborator: named
//! collections of JSON records, the current + historical schema documents
//! for every source, and the upload/query logs. Backends are injected
//! explicitly (SQLite in the binary crate, [`memory::InMemoryStore`] in
//! tests), never held as process-wide state.
//!
//! Filtering, projection and aggregation semantics are shared by every
//! backend through [`query_eval`].

pub mod memory;
pub mod query_eval;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{FragmentType, Record};
use crate::router::SOURCE_FIELD;
use crate::schema::SourceSchema;

/// Key under which a store keeps a record's identifier.
pub const ID_FIELD: &str = "_id";

/// Key of the opaque identifier wrapper, e.g. `{"$oid": "9f0c..."}`.
pub const OID_KEY: &str = "$oid";

/// Generate a fresh opaque record identifier.
pub fn new_object_id() -> Value {
    json!({ OID_KEY: uuid::Uuid::new_v4().simple().to_string() })
}

/// The source a filter is pinned to, if any: a top-level string
/// `_source_id` equality, or one inside a top-level `$and`.
///
/// Backends use this to pre-select rows; the full filter still runs.
pub fn filter_source_scope(filter: &Record) -> Option<&str> {
    if let Some(id) = filter.get(SOURCE_FIELD).and_then(Value::as_str) {
        return Some(id);
    }
    filter
        .get("$and")?
        .as_array()?
        .iter()
        .filter_map(Value::as_object)
        .find_map(filter_source_scope)
}

/// The source a pipeline is pinned to by its leading `$match` stage.
pub fn pipeline_source_scope(pipeline: &[Value]) -> Option<&str> {
    let stage = pipeline.first()?.get("$match")?.as_object()?;
    filter_source_scope(stage)
}

/// Result of a conditional schema commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored current version was not the expected one.
    VersionConflict { found: Option<u64> },
}

/// One ingest, as recorded in the upload log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub source_id: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    /// SHA-256 of the decoded text.
    pub content_hash: String,
    pub fragment_count: usize,
    pub record_count: usize,
    pub data_types: Vec<FragmentType>,
    pub schema_version: u64,
}

/// One executed (or failed) query, as recorded in the query log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub source_id: String,
    /// `"NL"` or `"DB"`.
    pub query_type: String,
    pub query_text: String,
    /// Structured query that actually ran, after translation.
    pub executed_query: Option<Value>,
    pub result_count: usize,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Abstract document store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_many`](Store::insert_many) | Append records to a collection |
/// | [`find`](Store::find) | Filter + project a collection |
/// | [`aggregate`](Store::aggregate) | Run a pipeline over a collection |
/// | [`read_schema`](Store::read_schema) | Current schema of a source |
/// | [`commit_schema`](Store::commit_schema) | Conditional upsert + history append |
/// | [`schema_history`](Store::schema_history) | Every committed version |
/// | [`log_upload`](Store::log_upload) / [`uploads`](Store::uploads) | Upload log |
/// | [`log_query`](Store::log_query) / [`queries`](Store::queries) | Query log |
#[async_trait]
pub trait Store: Send + Sync {
    /// Append records, assigning each a fresh `_id`. Returns the count.
    async fn insert_many(&self, collection: &str, records: Vec<Record>) -> Result<usize>;

    /// Records of `collection` matching `filter`, shaped by `projection`,
    /// in insertion order and capped at `limit`.
    async fn find(
        &self,
        collection: &str,
        filter: &Record,
        projection: &Record,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Run an aggregation pipeline over `collection`, capped at `limit`.
    async fn aggregate(&self, collection: &str, pipeline: &[Value], limit: usize)
        -> Result<Vec<Record>>;

    async fn read_schema(&self, source_id: &str) -> Result<Option<SourceSchema>>;

    /// Replace the current schema and append it to the history log as one
    /// atomic step, provided the stored version still equals
    /// `expected_version` (`None` meaning no schema exists yet).
    async fn commit_schema(
        &self,
        schema: &SourceSchema,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome>;

    /// All committed versions of a source, oldest first.
    async fn schema_history(&self, source_id: &str) -> Result<Vec<SourceSchema>>;

    async fn log_upload(&self, event: &UploadEvent) -> Result<()>;

    /// Upload log of a source, newest first.
    async fn uploads(&self, source_id: &str) -> Result<Vec<UploadEvent>>;

    async fn log_query(&self, event: &QueryEvent) -> Result<()>;

    /// Query log of a source, newest first.
    async fn queries(&self, source_id: &str) -> Result<Vec<QueryEvent>>;
}
