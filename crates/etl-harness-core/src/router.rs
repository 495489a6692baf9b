//! Schema-aware query routing.
//!
//! A [`StructuredQuery`] names no collection. The router decides which of a
//! source's collections can answer it, runs it against each, and
//! concatenates the results in the schema's collection order.
//!
//! - `find` is routed by field eligibility: every field the filter
//!   references must be known to the collection, and a projection (other
//!   than `_id`) must touch at least one known field. A failure on any
//!   collection fails the whole query.
//! - `aggregate` runs on every collection. A collection whose pipeline
//!   errors is logged and skipped.
//!
//! Queries are scoped to the schema's source: records loaded for other
//! sources share the collections but never appear in results.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EtlError, Result};
use crate::models::Record;
use crate::schema::SourceSchema;
use crate::store::{Store, ID_FIELD, OID_KEY};

/// Field every loaded record is tagged with.
pub const SOURCE_FIELD: &str = "_source_id";

/// Field holding the RFC 3339 load time of a record.
pub const UPLOADED_AT_FIELD: &str = "_uploaded_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Find,
    Aggregate,
}

/// A store-agnostic query: `{operation, filter?, projection?, pipeline?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub operation: String,
    #[serde(default)]
    pub filter: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Record>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<Value>,
}

impl StructuredQuery {
    pub fn find(filter: Record) -> Self {
        Self {
            operation: "find".to_string(),
            filter,
            projection: None,
            pipeline: Vec::new(),
        }
    }

    pub fn aggregate(pipeline: Vec<Value>) -> Self {
        Self {
            operation: "aggregate".to_string(),
            filter: Record::new(),
            projection: None,
            pipeline,
        }
    }

    /// `None` for operations the router does not know.
    pub fn operation(&self) -> Option<Operation> {
        match self.operation.as_str() {
            "find" => Some(Operation::Find),
            "aggregate" => Some(Operation::Aggregate),
            _ => None,
        }
    }

    /// Build a query from decoded JSON. A missing `operation` means `find`;
    /// null members count as absent.
    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("query must be a JSON object".to_string());
        };
        let operation = match map.remove("operation") {
            None | Some(Value::Null) => "find".to_string(),
            Some(Value::String(op)) => op,
            Some(other) => return Err(format!("operation must be a string, got {}", other)),
        };
        let filter = match map.remove("filter") {
            None | Some(Value::Null) => Record::new(),
            Some(Value::Object(filter)) => filter,
            Some(_) => return Err("filter must be an object".to_string()),
        };
        let projection = match map.remove("projection") {
            None | Some(Value::Null) => None,
            Some(Value::Object(projection)) => Some(projection),
            Some(_) => return Err("projection must be an object".to_string()),
        };
        let pipeline = match map.remove("pipeline") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(stages)) => stages,
            Some(_) => return Err("pipeline must be an array".to_string()),
        };
        Ok(Self {
            operation,
            filter,
            projection,
            pipeline,
        })
    }
}

/// Parse query text into a [`StructuredQuery`], keeping the raw text in
/// the error.
pub fn parse_query(text: &str) -> Result<StructuredQuery> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| EtlError::query_parse(text, e.to_string()))?;
    StructuredQuery::from_value(value).map_err(|message| EtlError::query_parse(text, message))
}

/// Top-level field names a filter references. Combinator operands are
/// descended into; a field's own operator mapping is not.
pub fn filter_fields(filter: &Record) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    collect_filter_fields(filter, &mut fields);
    fields
}

fn collect_filter_fields(filter: &Record, fields: &mut BTreeSet<String>) {
    for (key, value) in filter {
        if key.starts_with('$') {
            match value {
                Value::Object(nested) => collect_filter_fields(nested, fields),
                Value::Array(clauses) => {
                    for clause in clauses.iter().filter_map(Value::as_object) {
                        collect_filter_fields(clause, fields);
                    }
                }
                _ => {}
            }
        } else {
            fields.insert(top_level(key).to_string());
        }
    }
}

/// Top-level field names a projection references, `_id` excluded.
pub fn projection_fields(projection: &Record) -> BTreeSet<String> {
    projection
        .keys()
        .map(|k| top_level(k))
        .filter(|k| *k != ID_FIELD)
        .map(str::to_string)
        .collect()
}

fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Replace opaque identifiers (`{"$oid": "..."}`) with their string form,
/// at any depth.
pub fn normalize_ids(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(oid)) = map.get(OID_KEY) {
                    return Value::String(oid.clone());
                }
            }
            Value::Object(normalize_record(map))
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_ids).collect()),
        other => other,
    }
}

pub fn normalize_record(record: Record) -> Record {
    record
        .into_iter()
        .map(|(k, v)| (k, normalize_ids(v)))
        .collect()
}

fn default_projection() -> Record {
    let mut projection = Record::new();
    projection.insert(ID_FIELD.to_string(), Value::from(0));
    projection
}

pub struct QueryRouter<'a> {
    store: &'a dyn Store,
    /// Per-collection result cap.
    limit: usize,
}

impl<'a> QueryRouter<'a> {
    pub fn new(store: &'a dyn Store, limit: usize) -> Self {
        Self { store, limit }
    }

    /// Collections of `schema` that a `find` with this filter and
    /// projection may be sent to, in schema order.
    pub fn eligible_collections<'s>(
        schema: &'s SourceSchema,
        filter: &Record,
        projection: &Record,
    ) -> Vec<&'s str> {
        let wanted_filter = filter_fields(filter);
        let wanted_projection = projection_fields(projection);
        schema
            .collections
            .keys()
            .map(String::as_str)
            .filter(|name| {
                let Some(fields) = schema.field_names(name) else {
                    return false;
                };
                let fields: HashSet<&str> = fields.collect();
                let known = |f: &String| fields.contains(f.as_str());
                let filter_ok = wanted_filter.iter().all(known);
                let projection_ok =
                    wanted_projection.is_empty() || wanted_projection.iter().any(known);
                filter_ok && projection_ok
            })
            .collect()
    }

    pub async fn execute(
        &self,
        query: &StructuredQuery,
        schema: &SourceSchema,
    ) -> Result<Vec<Record>> {
        if schema.collections.is_empty() {
            return Ok(Vec::new());
        }
        let results = match query.operation() {
            Some(Operation::Find) => self.find(query, schema).await?,
            Some(Operation::Aggregate) => self.aggregate(query, schema).await,
            None => {
                info!(operation = %query.operation, "unknown query operation, returning no results");
                Vec::new()
            }
        };
        Ok(results.into_iter().map(normalize_record).collect())
    }

    async fn find(&self, query: &StructuredQuery, schema: &SourceSchema) -> Result<Vec<Record>> {
        let projection = query.projection.clone().unwrap_or_else(default_projection);
        let eligible = Self::eligible_collections(schema, &query.filter, &projection);
        debug!(source_id = %schema.source_id, collections = ?eligible, "routing find");

        let filter = scoped_filter(&query.filter, &schema.source_id);
        let mut results = Vec::new();
        for collection in eligible {
            let found = self
                .store
                .find(collection, &filter, &projection, self.limit)
                .await
                .map_err(|e| EtlError::query_execution(collection, e))?;
            results.extend(found);
        }
        Ok(results)
    }

    async fn aggregate(&self, query: &StructuredQuery, schema: &SourceSchema) -> Vec<Record> {
        let mut pipeline = Vec::with_capacity(query.pipeline.len() + 1);
        pipeline.push(serde_json::json!({ "$match": { SOURCE_FIELD: schema.source_id } }));
        pipeline.extend(query.pipeline.iter().cloned());

        let mut results = Vec::new();
        for collection in schema.collections.keys() {
            match self.store.aggregate(collection, &pipeline, self.limit).await {
                Ok(rows) => results.extend(rows),
                Err(e) => warn!(
                    collection = %collection,
                    error = %e,
                    "aggregate failed on collection, skipping"
                ),
            }
        }
        results
    }
}

fn scoped_filter(filter: &Record, source_id: &str) -> Record {
    let mut scope = Record::new();
    scope.insert(SOURCE_FIELD.to_string(), Value::from(source_id));
    if filter.is_empty() {
        return scope;
    }
    let mut scoped = Record::new();
    scoped.insert(
        "$and".to_string(),
        Value::Array(vec![Value::Object(scope), Value::Object(filter.clone())]),
    );
    scoped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fragment, FragmentType, ParsedData};
    use crate::schema::infer_and_merge;
    use crate::store::memory::InMemoryStore;
    use crate::store::{CommitOutcome, QueryEvent, UploadEvent};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    /// Delegates to an in-memory store, remembering which collections were
    /// queried and failing aggregates on one of them.
    struct RecordingStore {
        inner: InMemoryStore,
        queried: Mutex<Vec<String>>,
        failing: Option<&'static str>,
    }

    impl RecordingStore {
        fn new(failing: Option<&'static str>) -> Self {
            Self {
                inner: InMemoryStore::new(),
                queried: Mutex::new(Vec::new()),
                failing,
            }
        }

        fn queried(&self) -> Vec<String> {
            self.queried.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn insert_many(&self, c: &str, r: Vec<Record>) -> anyhow::Result<usize> {
            self.inner.insert_many(c, r).await
        }
        async fn find(
            &self,
            c: &str,
            f: &Record,
            p: &Record,
            l: usize,
        ) -> anyhow::Result<Vec<Record>> {
            self.queried.lock().unwrap().push(c.to_string());
            self.inner.find(c, f, p, l).await
        }
        async fn aggregate(&self, c: &str, p: &[Value], l: usize) -> anyhow::Result<Vec<Record>> {
            self.queried.lock().unwrap().push(c.to_string());
            if self.failing == Some(c) {
                anyhow::bail!("simulated failure");
            }
            self.inner.aggregate(c, p, l).await
        }
        async fn read_schema(&self, s: &str) -> anyhow::Result<Option<SourceSchema>> {
            self.inner.read_schema(s).await
        }
        async fn commit_schema(
            &self,
            s: &SourceSchema,
            v: Option<u64>,
        ) -> anyhow::Result<CommitOutcome> {
            self.inner.commit_schema(s, v).await
        }
        async fn schema_history(&self, s: &str) -> anyhow::Result<Vec<SourceSchema>> {
            self.inner.schema_history(s).await
        }
        async fn log_upload(&self, e: &UploadEvent) -> anyhow::Result<()> {
            self.inner.log_upload(e).await
        }
        async fn uploads(&self, s: &str) -> anyhow::Result<Vec<UploadEvent>> {
            self.inner.uploads(s).await
        }
        async fn log_query(&self, e: &QueryEvent) -> anyhow::Result<()> {
            self.inner.log_query(e).await
        }
        async fn queries(&self, s: &str) -> anyhow::Result<Vec<QueryEvent>> {
            self.inner.queries(s).await
        }
    }

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn fragment(kind: FragmentType, rows: Value) -> Fragment {
        let rows = rows.as_array().cloned().unwrap();
        Fragment::new(kind, 1, 1, "", ParsedData::Records(rows))
    }

    /// `json_data` knows `price`/`title`, `csv_data` knows `name`.
    async fn seeded(store: &dyn Store, source_id: &str) -> SourceSchema {
        let json_rows = json!([{"price": 150, "title": "lamp"}, {"price": 40, "title": "mug"}]);
        let csv_rows = json!([{"name": "Alice"}, {"name": "Bob"}]);
        let schema = infer_and_merge(
            source_id,
            &[
                fragment(FragmentType::Json, json_rows.clone()),
                fragment(FragmentType::Csv, csv_rows.clone()),
            ],
            None,
            Utc::now(),
        );
        for (collection, rows) in [("json_data", json_rows), ("csv_data", csv_rows)] {
            let tagged = rows
                .as_array()
                .unwrap()
                .iter()
                .map(|r| {
                    let mut r = rec(r.clone());
                    r.insert(SOURCE_FIELD.to_string(), json!(source_id));
                    r
                })
                .collect();
            store.insert_many(collection, tagged).await.unwrap();
        }
        schema
    }

    #[test]
    fn parse_defaults_and_errors() {
        let q = parse_query(r#"{"filter": {"a": 1}}"#).unwrap();
        assert_eq!(q.operation(), Some(Operation::Find));
        assert_eq!(q.filter, rec(json!({"a": 1})));
        assert!(q.projection.is_none());

        let q = parse_query(r#"{"operation": "aggregate", "pipeline": [{"$count": "n"}], "filter": null}"#)
            .unwrap();
        assert_eq!(q.operation(), Some(Operation::Aggregate));
        assert!(q.filter.is_empty());

        match parse_query("find everything").unwrap_err() {
            EtlError::QueryParse { raw, .. } => assert_eq!(raw, "find everything"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_query("[1, 2]").is_err());
        assert!(parse_query(r#"{"filter": "price > 3"}"#).is_err());
    }

    #[test]
    fn filter_field_collection() {
        let filter = rec(json!({
            "price": {"$gt": 10},
            "$or": [{"name": "x"}, {"$and": [{"meta.tag": "y"}]}],
            "$nor": [{"qty": 0}],
        }));
        let fields: Vec<_> = filter_fields(&filter).into_iter().collect();
        assert_eq!(fields, vec!["meta", "name", "price", "qty"]);

        let projection = rec(json!({"_id": 0, "title": 1, "dims.w": 1}));
        let fields: Vec<_> = projection_fields(&projection).into_iter().collect();
        assert_eq!(fields, vec!["dims", "title"]);
    }

    #[test]
    fn eligible_collections_follow_known_field_names() {
        let schema = infer_and_merge(
            "s1",
            &[
                fragment(FragmentType::Json, json!([{"price": 3, "meta": {"tag": "a"}}])),
                fragment(FragmentType::Csv, json!([{"name": "x", "price": 1}])),
            ],
            None,
            Utc::now(),
        );
        let none = Record::new();
        let by_price = rec(json!({"price": {"$lt": 5}}));
        assert_eq!(
            QueryRouter::eligible_collections(&schema, &by_price, &none),
            vec!["json_data", "csv_data"]
        );
        let by_tag = rec(json!({"meta.tag": "a"}));
        assert_eq!(QueryRouter::eligible_collections(&schema, &by_tag, &none), vec!["json_data"]);
        let shows_name = rec(json!({"_id": 0, "name": 1}));
        assert_eq!(
            QueryRouter::eligible_collections(&schema, &none, &shows_name),
            vec!["csv_data"]
        );
        let unknown = rec(json!({"colour": "red"}));
        assert!(QueryRouter::eligible_collections(&schema, &unknown, &none).is_empty());
    }

    #[test]
    fn ids_are_normalized_at_any_depth() {
        let value = json!({
            "_id": {"$oid": "abc"},
            "items": [{"ref": {"$oid": "def"}}, [{"$oid": "ghi"}]],
            "keep": {"$oid": "x", "other": 1},
        });
        assert_eq!(
            normalize_ids(value),
            json!({
                "_id": "abc",
                "items": [{"ref": "def"}, ["ghi"]],
                "keep": {"$oid": "x", "other": 1},
            })
        );
    }

    #[tokio::test]
    async fn find_is_routed_only_to_collections_that_know_the_fields() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        let query = parse_query(r#"{"operation":"find","filter":{"price":{"$gt":100}}}"#).unwrap();

        let results = QueryRouter::new(&store, 100).execute(&query, &schema).await.unwrap();

        assert_eq!(store.queried(), vec!["json_data"]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["title"], json!("lamp"));
        assert!(!results[0].contains_key("_id"));
    }

    #[tokio::test]
    async fn projection_must_touch_a_known_field() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        let query = StructuredQuery {
            projection: Some(rec(json!({"name": 1, "_id": 0}))),
            ..StructuredQuery::find(Record::new())
        };
        let results = QueryRouter::new(&store, 100).execute(&query, &schema).await.unwrap();
        assert_eq!(store.queried(), vec!["csv_data"]);
        assert_eq!(
            results.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"name": "Alice"}), json!({"name": "Bob"})]
        );
    }

    #[tokio::test]
    async fn empty_filter_hits_every_collection_in_schema_order() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        let results = QueryRouter::new(&store, 100)
            .execute(&StructuredQuery::find(Record::new()), &schema)
            .await
            .unwrap();
        assert_eq!(store.queried(), vec!["json_data", "csv_data"]);
        assert_eq!(results.len(), 4);
    }

    #[tokio::test]
    async fn results_are_scoped_to_the_source() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        seeded(&store, "s2").await;
        let results = QueryRouter::new(&store, 100)
            .execute(&StructuredQuery::find(rec(json!({"name": "Bob"}))), &schema)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0][SOURCE_FIELD], json!("s1"));
    }

    #[tokio::test]
    async fn aggregate_skips_failing_collections() {
        let store = RecordingStore::new(Some("json_data"));
        let schema = seeded(&store, "s1").await;
        let query = StructuredQuery::aggregate(vec![json!({"$count": "n"})]);
        let results = QueryRouter::new(&store, 100).execute(&query, &schema).await.unwrap();
        assert_eq!(store.queried(), vec!["json_data", "csv_data"]);
        assert_eq!(
            results.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"n": 2})]
        );
    }

    #[tokio::test]
    async fn find_failure_fails_the_query() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        let query = StructuredQuery::find(rec(json!({"price": {"$near": 3}})));
        let err = QueryRouter::new(&store, 100)
            .execute(&query, &schema)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::QueryExecution { ref collection, .. } if collection == "json_data"));
    }

    #[tokio::test]
    async fn unknown_operation_and_empty_schema_yield_nothing() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        let query = StructuredQuery {
            operation: "delete".to_string(),
            ..StructuredQuery::find(Record::new())
        };
        let router = QueryRouter::new(&store, 100);
        assert!(router.execute(&query, &schema).await.unwrap().is_empty());

        let empty = infer_and_merge("s3", &[], None, Utc::now());
        assert!(router
            .execute(&StructuredQuery::find(Record::new()), &empty)
            .await
            .unwrap()
            .is_empty());
        assert!(store.queried().is_empty());
    }

    #[tokio::test]
    async fn ids_come_back_as_strings_when_projected() {
        let store = RecordingStore::new(None);
        let schema = seeded(&store, "s1").await;
        let query = StructuredQuery {
            projection: Some(rec(json!({"_id": 1, "name": 1}))),
            ..StructuredQuery::find(Record::new())
        };
        let results = QueryRouter::new(&store, 100).execute(&query, &schema).await.unwrap();
        assert!(results[0]["_id"].is_string());
    }
}
