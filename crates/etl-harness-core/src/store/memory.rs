//! In-memory [`Store`] implementation for tests.
//!
//! Collections, schemas and logs live in `HashMap`s and `Vec`s behind
//! `std::sync::RwLock`. Queries go through the shared [`query_eval`]
//! evaluator, so results match the SQLite backend.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::query_eval::{self, CompiledFilter};
use super::{CommitOutcome, QueryEvent, Store, UploadEvent, ID_FIELD};
use crate::models::Record;
use crate::schema::SourceSchema;

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
    /// Current schema plus history, guarded together so commits are atomic.
    schemas: RwLock<SchemaTables>,
    uploads: RwLock<Vec<UploadEvent>>,
    queries: RwLock<Vec<QueryEvent>>,
}

#[derive(Default)]
struct SchemaTables {
    current: HashMap<String, SourceSchema>,
    history: Vec<SourceSchema>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> Result<usize> {
        Ok(read(&self.collections)?
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0))
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

/// Newest first.
fn for_source<T: Clone>(events: &[T], source_id: &str, key: impl Fn(&T) -> &str) -> Vec<T> {
    events
        .iter()
        .rev()
        .filter(|e| key(e) == source_id)
        .cloned()
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_many(&self, collection: &str, records: Vec<Record>) -> Result<usize> {
        let count = records.len();
        let mut collections = write(&self.collections)?;
        let stored = collections.entry(collection.to_string()).or_default();
        for record in records {
            let mut doc = Record::new();
            doc.insert(ID_FIELD.to_string(), super::new_object_id());
            doc.extend(record.into_iter().filter(|(k, _)| k != ID_FIELD));
            stored.push(doc);
        }
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
        let collections = read(&self.collections)?;
        let mut out = Vec::new();
        for doc in collections.get(collection).into_iter().flatten() {
            if out.len() >= limit {
                break;
            }
            if compiled.matches(doc)? {
                out.push(query_eval::project(doc, projection)?);
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
        let docs = read(&self.collections)?
            .get(collection)
            .cloned()
            .unwrap_or_default();
        let mut out = query_eval::run_pipeline(docs, pipeline)?;
        out.truncate(limit);
        Ok(out)
    }

    async fn read_schema(&self, source_id: &str) -> Result<Option<SourceSchema>> {
        Ok(read(&self.schemas)?.current.get(source_id).cloned())
    }

    async fn commit_schema(
        &self,
        schema: &SourceSchema,
        expected_version: Option<u64>,
    ) -> Result<CommitOutcome> {
        let mut tables = write(&self.schemas)?;
        let found = tables.current.get(&schema.source_id).map(|s| s.version);
        if found != expected_version {
            return Ok(CommitOutcome::VersionConflict { found });
        }
        tables.history.push(schema.clone());
        tables
            .current
            .insert(schema.source_id.clone(), schema.clone());
        Ok(CommitOutcome::Committed)
    }

    async fn schema_history(&self, source_id: &str) -> Result<Vec<SourceSchema>> {
        let tables = read(&self.schemas)?;
        let mut history: Vec<SourceSchema> = tables
            .history
            .iter()
            .filter(|s| s.source_id == source_id)
            .cloned()
            .collect();
        history.sort_by_key(|s| s.version);
        Ok(history)
    }

    async fn log_upload(&self, event: &UploadEvent) -> Result<()> {
        write(&self.uploads)?.push(event.clone());
        Ok(())
    }

    async fn uploads(&self, source_id: &str) -> Result<Vec<UploadEvent>> {
        Ok(for_source(&read(&self.uploads)?, source_id, |e| e.source_id.as_str()))
    }

    async fn log_query(&self, event: &QueryEvent) -> Result<()> {
        write(&self.queries)?.push(event.clone());
        Ok(())
    }

    async fn queries(&self, source_id: &str) -> Result<Vec<QueryEvent>> {
        Ok(for_source(&read(&self.queries)?, source_id, |e| e.source_id.as_str()))
    }
}
