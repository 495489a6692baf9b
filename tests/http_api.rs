//! HTTP API through the axum router, without binding a socket.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use etl_harness::config::Config;
use etl_harness::server::{build_router, AppState};
use etl_harness::translate::{DisabledTranslator, QueryTranslator};
use etl_harness_core::schema::SourceSchema;
use etl_harness_core::store::memory::InMemoryStore;

const INVENTORY: &str = "Inventory notes for March.\n\
[{\"item\": \"lamp\", \"price\": \"150\"}, {\"item\": \"mug\", \"price\": \"8\"}]\n\
End of notes.\n";

struct CannedTranslator(&'static str);

#[async_trait]
impl QueryTranslator for CannedTranslator {
    fn name(&self) -> &str {
        "canned"
    }

    async fn translate(&self, _question: &str, _schema: &SourceSchema) -> Result<String> {
        Ok(self.0.to_string())
    }
}

fn app_with(translator: Arc<dyn QueryTranslator>) -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("unused.sqlite"));
    config.ingest.upload_dir = tmp.path().join("uploads");
    let state = AppState::new(config, Arc::new(InMemoryStore::new()), translator);
    (tmp, build_router(state))
}

fn app() -> (TempDir, Router) {
    app_with(Arc::new(DisabledTranslator))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    send(app, req).await
}

const BOUNDARY: &str = "etl-harness-test-boundary";

/// A multipart body with an optional `source_id` field and an optional
/// `file` part.
fn multipart_body(source_id: Option<&str>, file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(source_id) = source_id {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"source_id\"\r\n\r\n{source_id}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_multipart(app: &Router, body: Vec<u8>) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    send(app, req).await
}

async fn upload_file(app: &Router, source_id: &str, filename: &str, bytes: &[u8]) -> (StatusCode, Value) {
    post_multipart(app, multipart_body(Some(source_id), Some((filename, bytes)))).await
}

async fn upload(app: &Router, source_id: &str, text: &str) -> (StatusCode, Value) {
    upload_file(app, source_id, "notes.md", text.as_bytes()).await
}

#[tokio::test]
async fn health_reports_ok() {
    let (_tmp, app) = app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn upload_then_schema_records_and_history() {
    let (tmp, app) = app();

    let (status, summary) = upload(&app, "shop", INVENTORY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["schema_version"], 1);
    assert_eq!(summary["total_records"], 2);
    assert_eq!(summary["loaded"]["json_data"], 2);

    let (status, schema) = call(&app, "GET", "/api/schema?source_id=shop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(schema["version"], 1);
    assert_eq!(
        schema["collections"]["json_data"]["fields"]["price"]["type"],
        "integer"
    );

    upload(&app, "shop", INVENTORY).await;
    let (_, history) = call(&app, "GET", "/api/schema/history?source_id=shop", None).await;
    let versions: Vec<_> = history.as_array().unwrap().iter().map(|s| s["version"].clone()).collect();
    assert_eq!(versions, vec![json!(1), json!(2)]);

    let (status, records) = call(&app, "GET", "/api/records?source_id=shop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records["count"], 4);
    assert_eq!(records["records"][0]["_source_id"], "shop");
    assert!(records["records"][0].get("_id").is_none());

    let (_, uploads) = call(&app, "GET", "/api/history/uploads?source_id=shop", None).await;
    assert_eq!(uploads.as_array().unwrap().len(), 2);
    assert_eq!(uploads[0]["schema_version"], 2);

    assert!(tmp.path().join("uploads/shop").is_dir());
}

#[tokio::test]
async fn db_query_runs_and_is_logged() {
    let (_tmp, app) = app();
    upload(&app, "shop", INVENTORY).await;

    let (status, outcome) = call(
        &app,
        "POST",
        "/api/query",
        Some(json!({
            "source_id": "shop",
            "query_type": "DB",
            "query_text": r#"{"filter": {"price": {"$gt": 100}}}"#,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["query_type"], "DB");
    assert_eq!(outcome["result_count"], 1);
    assert_eq!(outcome["results"][0]["item"], "lamp");

    let (_, queries) = call(&app, "GET", "/api/history/queries?source_id=shop", None).await;
    assert_eq!(queries.as_array().unwrap().len(), 1);
    assert_eq!(queries[0]["result_count"], 1);
    assert!(queries[0]["error"].is_null());
}

#[tokio::test]
async fn nl_query_uses_translator_reply() {
    let (_tmp, app) = app_with(Arc::new(CannedTranslator(
        "```json\n{\"operation\": \"find\", \"filter\": {\"item\": \"mug\"}}\n```",
    )));
    upload(&app, "shop", INVENTORY).await;

    let (status, outcome) = call(
        &app,
        "POST",
        "/api/query",
        Some(json!({"source_id": "shop", "query_type": "NL", "query_text": "the mug?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["query_type"], "NL");
    assert_eq!(outcome["results"][0]["price"], 8);
}

#[tokio::test]
async fn prose_upload_is_unprocessable() {
    let (_tmp, app) = app();
    let (status, body) = upload(&app, "shop", "Just a paragraph.\nNothing structured here.").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "no_structured_data");

    let (status, _) = call(&app, "GET", "/api/schema?source_id=shop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disallowed_extension_is_rejected() {
    let (_tmp, app) = app();
    let (status, body) = upload_file(&app, "shop", "data.exe", INVENTORY.as_bytes()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn latin1_text_upload_is_decoded_on_the_server() {
    let (tmp, app) = app();
    let bytes = b"Visitors:\nname,city\nRen\xe9,Oslo\nAda,Z\xfcrich\n";
    let (status, summary) = upload_file(&app, "guests", "visitors.txt", bytes).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["loaded"]["csv_data"], 2);

    let (_, records) = call(&app, "GET", "/api/records?source_id=guests", None).await;
    assert_eq!(records["records"][0]["name"], "Ren\u{e9}");
    assert_eq!(records["records"][1]["city"], "Z\u{fc}rich");

    // the archive keeps the bytes exactly as uploaded
    let archived: Vec<_> = std::fs::read_dir(tmp.path().join("uploads/guests"))
        .unwrap()
        .map(|entry| std::fs::read(entry.unwrap().path()).unwrap())
        .collect();
    assert_eq!(archived, vec![bytes.to_vec()]);
}

#[tokio::test]
async fn pdf_upload_goes_through_the_pdf_decoder() {
    let (_tmp, app) = app();
    // Valid text, but not a PDF: it must not be ingested as plain text.
    let (status, body) = upload_file(&app, "shop", "inventory.pdf", INVENTORY.as_bytes()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = call(&app, "GET", "/api/schema?source_id=shop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_requires_source_id_and_file_parts() {
    let (_tmp, app) = app();
    let file = Some(("notes.md", INVENTORY.as_bytes()));

    let (status, body) = post_multipart(&app, multipart_body(None, file)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "source_id is required");

    let (status, body) = post_multipart(&app, multipart_body(Some("shop"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "file is required");

    // A JSON body is no longer an upload.
    let (status, _) = call(
        &app,
        "POST",
        "/api/upload",
        Some(json!({"source_id": "shop", "filename": "notes.md", "text": INVENTORY})),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn malformed_query_returns_raw_text() {
    let (_tmp, app) = app();
    upload(&app, "shop", INVENTORY).await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/query",
        Some(json!({"source_id": "shop", "query_type": "DB", "query_text": "price > 100"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "query_parse_error");
    assert_eq!(body["error"]["raw"], "price > 100");

    let (_, queries) = call(&app, "GET", "/api/history/queries?source_id=shop", None).await;
    assert!(queries[0]["error"].is_string());
}

#[tokio::test]
async fn nl_query_without_translator_is_bad_gateway() {
    let (_tmp, app) = app();
    upload(&app, "shop", INVENTORY).await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/query",
        Some(json!({"source_id": "shop", "query_type": "NL", "query_text": "anything"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "translation_error");
}

#[tokio::test]
async fn unknown_source_and_missing_param() {
    let (_tmp, app) = app();

    let (status, body) = call(&app, "GET", "/api/schema?source_id=ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = call(&app, "GET", "/api/records", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}
