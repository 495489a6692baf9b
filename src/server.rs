//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/upload` | Ingest a multipart upload: `source_id` field + `file` part |
//! | `GET`  | `/api/schema?source_id=` | Current schema |
//! | `GET`  | `/api/schema/history?source_id=` | Every schema version |
//! | `POST` | `/api/query` | Run `{source_id, query_type: "NL"\|"DB", query_text}` |
//! | `GET`  | `/api/records?source_id=` | All records of a source |
//! | `GET`  | `/api/history/uploads?source_id=` | Upload log |
//! | `GET`  | `/api/history/queries?source_id=` | Query log |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "query_parse_error", "message": "...", "raw": "price > 100" } }
//! ```
//!
//! Codes: `bad_request` (400), `query_parse_error` (400), `not_found` (404),
//! `no_structured_data` (422), `translation_error` (502),
//! `query_execution_error` (500), `internal` (500).

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use etl_harness_core::schema::SourceSchema;
use etl_harness_core::store::{QueryEvent, Store, UploadEvent};
use etl_harness_core::{EtlError, Record};

use crate::config::Config;
use crate::decode::DecodeError;
use crate::ingest::{archive_upload, IngestSummary, Pipeline};
use crate::query::{QueryOutcome, QueryService, QueryType};
use crate::translate::{create_translator, QueryTranslator};
use crate::{db, migrate, sqlite_store::SqliteStore};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    queries: Arc<QueryService>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        translator: Arc<dyn QueryTranslator>,
    ) -> Self {
        let pipeline = Pipeline::new(store.clone(), config.ingest.clone());
        let queries = QueryService::new(store, translator, config.query.result_limit);
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            queries: Arc::new(queries),
        }
    }
}

/// Open the database, apply migrations and serve on `[server].bind` until
/// the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    let translator = create_translator(&config.translator)?;
    info!(translator = translator.name(), "translator ready");

    let bind_addr = config.server.bind.clone();
    let app = build_router(AppState::new(config.clone(), store, translator));

    info!("ETL server listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/upload",
            post(handle_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/schema", get(handle_schema))
        .route("/api/schema/history", get(handle_schema_history))
        .route("/api/query", post(handle_query))
        .route("/api/records", get(handle_records))
        .route("/api/history/uploads", get(handle_upload_history))
        .route("/api/history/queries", get(handle_query_history))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    /// Offending query text, for query parse errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
}

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    raw: Option<String>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            raw: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                raw: self.raw,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        if let Some(etl) = err.downcast_ref::<EtlError>() {
            warn!(kind = etl.kind(), error = %message, "request failed");
            return match etl {
                EtlError::NoStructuredData => {
                    AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "no_structured_data", message)
                }
                EtlError::QueryParse { raw, .. } => AppError {
                    raw: Some(raw.clone()),
                    ..AppError::new(StatusCode::BAD_REQUEST, "query_parse_error", message)
                },
                EtlError::SchemaNotFound(_) => {
                    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
                }
                EtlError::Translation(_) => {
                    AppError::new(StatusCode::BAD_GATEWAY, "translation_error", message)
                }
                EtlError::QueryExecution { .. } => AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "query_execution_error",
                    message,
                ),
                EtlError::Schema(_) | EtlError::Store(_) => {
                    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
                }
            };
        }
        if err.downcast_ref::<DecodeError>().is_some() {
            return bad_request(message);
        }
        error!(error = %message, "request failed");
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

// ============ Requests ============

#[derive(Deserialize)]
struct SourceParams {
    source_id: Option<String>,
}

impl SourceParams {
    fn required(self) -> Result<String, AppError> {
        match self.source_id {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(bad_request("source_id is required")),
        }
    }
}

/// Parts of a multipart upload: a `source_id` text field and a `file`
/// part carrying the original filename.
struct UploadForm {
    source_id: String,
    filename: String,
    bytes: Vec<u8>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut source_id = None;
        let mut file = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(format!("Malformed multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "source_id" => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| bad_request(format!("Unreadable source_id: {}", e)))?;
                    source_id = Some(text);
                }
                "file" => {
                    let filename = field.file_name().unwrap_or_default().to_string();
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| bad_request(format!("Unreadable file part: {}", e)))?;
                    file = Some((filename, bytes.to_vec()));
                }
                other => debug!(field = other, "ignoring unknown upload field"),
            }
        }

        let source_id = source_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| bad_request("source_id is required"))?;
        let (filename, bytes) = file.ok_or_else(|| bad_request("file is required"))?;
        if filename.is_empty() {
            return Err(bad_request("file part must carry a filename"));
        }
        Ok(Self {
            source_id,
            filename,
            bytes,
        })
    }
}

#[derive(Deserialize)]
struct QueryRequest {
    source_id: String,
    query_type: QueryType,
    query_text: String,
}

// ============ Handlers ============

async fn handle_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<IngestSummary>, AppError> {
    let form = UploadForm::read(multipart).await?;
    if !state.config.ingest.is_allowed(&form.filename) {
        return Err(bad_request(format!(
            "File type not allowed: '{}'. Allowed extensions: {}",
            form.filename,
            state.config.ingest.allowed_extensions.join(", ")
        )));
    }

    if let Err(e) = archive_upload(
        &state.config.ingest.upload_dir,
        &form.source_id,
        &form.filename,
        &form.bytes,
    ) {
        warn!(error = %e, "could not archive upload");
    }

    let summary = state
        .pipeline
        .ingest_bytes(&form.source_id, &form.filename, &form.bytes)
        .await?;
    Ok(Json(summary))
}

async fn handle_schema(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
) -> Result<Json<SourceSchema>, AppError> {
    let source_id = params.required()?;
    Ok(Json(state.queries.schema(&source_id).await?))
}

async fn handle_schema_history(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
) -> Result<Json<Vec<SourceSchema>>, AppError> {
    let source_id = params.required()?;
    Ok(Json(state.queries.schema_history(&source_id).await?))
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryOutcome>, AppError> {
    if req.query_text.trim().is_empty() {
        return Err(bad_request("query_text must not be empty"));
    }
    let outcome = state
        .queries
        .execute(&req.source_id, req.query_type, &req.query_text)
        .await?;
    Ok(Json(outcome))
}

#[derive(Serialize)]
struct RecordsResponse {
    source_id: String,
    count: usize,
    records: Vec<Record>,
}

async fn handle_records(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
) -> Result<Json<RecordsResponse>, AppError> {
    let source_id = params.required()?;
    let records = state.queries.records(&source_id).await?;
    Ok(Json(RecordsResponse {
        source_id,
        count: records.len(),
        records,
    }))
}

async fn handle_upload_history(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
) -> Result<Json<Vec<UploadEvent>>, AppError> {
    let source_id = params.required()?;
    Ok(Json(state.queries.upload_history(&source_id).await?))
}

async fn handle_query_history(
    State(state): State<AppState>,
    Query(params): Query<SourceParams>,
) -> Result<Json<Vec<QueryEvent>>, AppError> {
    let source_id = params.required()?;
    Ok(Json(state.queries.query_history(&source_id).await?))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
