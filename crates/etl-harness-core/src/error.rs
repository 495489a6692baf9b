//! Error taxonomy shared by every pipeline stage.
//!
//! A span that fails to parse during extraction is never an error value:
//! the extractor drops it and logs at `debug`. Everything else that a
//! caller must react to is an [`EtlError`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Debug, Error)]
pub enum EtlError {
    /// No fragment survived extraction for a document.
    #[error("no structured data (HTML/JSON/CSV/XML) found in document")]
    NoStructuredData,

    /// Query text is not a valid structured query. `raw` is the offending text.
    #[error("query is not valid structured JSON: {message} (raw: {raw})")]
    QueryParse { raw: String, message: String },

    /// Store-level failure while running a query against a collection.
    #[error("query failed on collection '{collection}': {message}")]
    QueryExecution { collection: String, message: String },

    /// Schema inference or persistence failed; fatal to the ingest.
    #[error("schema update failed: {0}")]
    Schema(String),

    /// No schema has been recorded for the source.
    #[error("no schema found for source_id={0}")]
    SchemaNotFound(String),

    /// The natural-language translator could not produce a query.
    #[error("query translation failed: {0}")]
    Translation(String),

    #[error("store error: {0}")]
    Store(String),
}

impl EtlError {
    pub fn query_parse(raw: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueryParse {
            raw: raw.into(),
            message: message.into(),
        }
    }

    pub fn query_execution(collection: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::QueryExecution {
            collection: collection.into(),
            message: err.to_string(),
        }
    }

    /// Machine-readable error kind, for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::NoStructuredData => "NoStructuredData",
            EtlError::QueryParse { .. } => "QueryParseError",
            EtlError::QueryExecution { .. } => "QueryExecutionError",
            EtlError::Schema(_) => "SchemaError",
            EtlError::SchemaNotFound(_) => "SchemaNotFound",
            EtlError::Translation(_) => "TranslationError",
            EtlError::Store(_) => "StoreError",
        }
    }
}
