//! Query service: structured and natural-language queries against one
//! source, plus the read-side views (records, schema, history).
//!
//! Every query attempt, successful or not, is appended to the query log.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use etl_harness_core::router::{parse_query, QueryRouter, StructuredQuery};
use etl_harness_core::schema::SourceSchema;
use etl_harness_core::store::{QueryEvent, Store, UploadEvent};
use etl_harness_core::{EtlError, Record};

use crate::translate::{extract_query_json, QueryTranslator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    #[serde(rename = "NL")]
    Nl,
    #[serde(rename = "DB")]
    Db,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Nl => "NL",
            QueryType::Db => "DB",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub source_id: String,
    pub query_type: QueryType,
    /// The structured query that ran.
    pub executed_query: StructuredQuery,
    pub result_count: usize,
    pub results: Vec<Record>,
}

pub struct QueryService {
    store: Arc<dyn Store>,
    translator: Arc<dyn QueryTranslator>,
    result_limit: usize,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn Store>,
        translator: Arc<dyn QueryTranslator>,
        result_limit: usize,
    ) -> Self {
        Self {
            store,
            translator,
            result_limit,
        }
    }

    pub async fn execute(
        &self,
        source_id: &str,
        query_type: QueryType,
        text: &str,
    ) -> Result<QueryOutcome> {
        let attempt = match query_type {
            QueryType::Db => self.run_db(source_id, text).await,
            QueryType::Nl => self.run_nl(source_id, text).await,
        };

        let mut event = QueryEvent {
            source_id: source_id.to_string(),
            query_type: query_type.as_str().to_string(),
            query_text: text.to_string(),
            executed_query: None,
            result_count: 0,
            error: None,
            executed_at: Utc::now(),
        };
        match &attempt {
            Ok((query, results)) => {
                event.executed_query = serde_json::to_value(query).ok();
                event.result_count = results.len();
            }
            Err(e) => event.error = Some(e.to_string()),
        }
        self.store.log_query(&event).await?;

        let (query, results) = attempt?;
        info!(source_id, query_type = query_type.as_str(), results = results.len(), "query executed");
        Ok(QueryOutcome {
            source_id: source_id.to_string(),
            query_type,
            executed_query: query,
            result_count: results.len(),
            results,
        })
    }

    /// Run query text that is already a structured JSON query.
    pub async fn execute_db_query(&self, source_id: &str, query_text: &str) -> Result<QueryOutcome> {
        self.execute(source_id, QueryType::Db, query_text).await
    }

    /// Translate a question into a structured query, then run it.
    pub async fn execute_nl_query(&self, source_id: &str, question: &str) -> Result<QueryOutcome> {
        self.execute(source_id, QueryType::Nl, question).await
    }

    async fn run_db(&self, source_id: &str, text: &str) -> Result<(StructuredQuery, Vec<Record>)> {
        let query = parse_query(text)?;
        let schema = self.schema(source_id).await?;
        let results = self.route(&query, &schema).await?;
        Ok((query, results))
    }

    async fn run_nl(&self, source_id: &str, question: &str) -> Result<(StructuredQuery, Vec<Record>)> {
        let schema = self.schema(source_id).await?;
        let reply = self
            .translator
            .translate(question, &schema)
            .await
            .map_err(|e| match e.downcast::<EtlError>() {
                Ok(etl) => etl,
                Err(other) => EtlError::Translation(format!("{:#}", other)),
            })?;

        let query = parse_query(extract_query_json(&reply)).map_err(|e| {
            warn!(
                source_id,
                translator = self.translator.name(),
                reply = %reply,
                "translator reply is not a valid query"
            );
            match e {
                EtlError::QueryParse { message, .. } => EtlError::query_parse(reply.clone(), message),
                other => other,
            }
        })?;
        let results = self.route(&query, &schema).await?;
        Ok((query, results))
    }

    async fn route(&self, query: &StructuredQuery, schema: &SourceSchema) -> Result<Vec<Record>> {
        Ok(QueryRouter::new(self.store.as_ref(), self.result_limit)
            .execute(query, schema)
            .await?)
    }

    /// Current schema of a source.
    pub async fn schema(&self, source_id: &str) -> Result<SourceSchema> {
        self.store
            .read_schema(source_id)
            .await?
            .ok_or_else(|| EtlError::SchemaNotFound(source_id.to_string()).into())
    }

    pub async fn schema_history(&self, source_id: &str) -> Result<Vec<SourceSchema>> {
        Ok(self.store.schema_history(source_id).await?)
    }

    /// Every record loaded for a source, across its collections, without
    /// store identifiers.
    pub async fn records(&self, source_id: &str) -> Result<Vec<Record>> {
        let schema = self.schema(source_id).await?;
        Ok(QueryRouter::new(self.store.as_ref(), usize::MAX)
            .execute(&StructuredQuery::find(Record::new()), &schema)
            .await?)
    }

    pub async fn query_history(&self, source_id: &str) -> Result<Vec<QueryEvent>> {
        Ok(self.store.queries(source_id).await?)
    }

    pub async fn upload_history(&self, source_id: &str) -> Result<Vec<UploadEvent>> {
        Ok(self.store.uploads(source_id).await?)
    }
}

/// JSON view of a query outcome's results, for printing.
pub fn results_json(outcome: &QueryOutcome) -> Value {
    Value::Array(outcome.results.iter().cloned().map(Value::Object).collect())
}
