//! Ingest pipeline orchestration.
//!
//! Coordinates one document through the stages, in order:
//! decode → extract → clean → infer schema + commit → load → upload log.
//! Schema commits for the same `source_id` are serialized by an async
//! mutex per source; the store's conditional commit guards against writers
//! outside this process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use etl_harness_core::clean::clean_records;
use etl_harness_core::extract::extract;
use etl_harness_core::router::{SOURCE_FIELD, UPLOADED_AT_FIELD};
use etl_harness_core::schema::evolve_schema;
use etl_harness_core::store::{Store, UploadEvent};
use etl_harness_core::{EtlError, Fragment, FragmentType, Record};

use crate::config::IngestConfig;
use crate::decode::decode_text;

/// Sample records shown per fragment in a summary.
const SAMPLE_RECORDS: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct FragmentSummary {
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    pub start_line: usize,
    pub end_line: usize,
    pub record_count: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub repaired: bool,
    pub sample_records: Vec<Record>,
}

/// What one ingest produced.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub source_id: String,
    pub filename: String,
    pub schema_version: u64,
    pub fragments: Vec<FragmentSummary>,
    pub total_fragments: usize,
    pub total_records: usize,
    pub data_types: Vec<FragmentType>,
    /// Records loaded per collection.
    pub loaded: IndexMap<String, usize>,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    config: IngestConfig,
    source_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    fn source_lock(&self, source_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .source_locks
            .lock()
            .map_err(|_| anyhow::anyhow!("source lock table poisoned"))?;
        Ok(locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Read, decode and ingest a file from disk.
    pub async fn ingest_file(&self, path: &Path, source_id: &str) -> Result<IngestSummary> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.ingest_bytes(source_id, &filename, &bytes).await
    }

    /// Decode uploaded bytes by extension and ingest the text.
    pub async fn ingest_bytes(
        &self,
        source_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestSummary> {
        if !self.config.is_allowed(filename) {
            anyhow::bail!(
                "File type not allowed: '{}'. Allowed extensions: {}",
                filename,
                self.config.allowed_extensions.join(", ")
            );
        }
        let text = decode_text(filename, bytes)?;
        self.ingest_text(source_id, &text, filename).await
    }

    /// Run the pipeline over decoded document text.
    pub async fn ingest_text(
        &self,
        source_id: &str,
        text: &str,
        filename: &str,
    ) -> Result<IngestSummary> {
        if source_id.trim().is_empty() {
            anyhow::bail!("source_id must not be empty");
        }

        let mut fragments = extract(text);
        if fragments.is_empty() {
            return Err(EtlError::NoStructuredData.into());
        }
        info!(source_id, filename, fragments = fragments.len(), "extracted fragments");

        for fragment in fragments.iter_mut() {
            if fragment.parsed_data.starts_with_mapping() {
                fragment.cleaned_records = Some(clean_records(&fragment.parsed_data.records()));
            } else {
                debug!(
                    start_line = fragment.start_line,
                    "fragment does not lead with a mapping, not cleaned"
                );
            }
        }

        let schema = {
            let lock = self.source_lock(source_id)?;
            let _guard = lock.lock().await;
            evolve_schema(self.store.as_ref(), source_id, &fragments).await?
        };

        let loaded = self.load(source_id, &fragments).await?;
        let total_records = loaded.values().sum();

        let data_types: Vec<FragmentType> = schema_types(&fragments);
        self.store
            .log_upload(&UploadEvent {
                source_id: source_id.to_string(),
                filename: filename.to_string(),
                uploaded_at: Utc::now(),
                content_hash: content_hash(text),
                fragment_count: fragments.len(),
                record_count: total_records,
                data_types: data_types.clone(),
                schema_version: schema.version,
            })
            .await
            .map_err(|e| EtlError::Store(e.to_string()))?;

        info!(
            source_id,
            filename,
            version = schema.version,
            records = total_records,
            "ingest complete"
        );

        Ok(IngestSummary {
            source_id: source_id.to_string(),
            filename: filename.to_string(),
            schema_version: schema.version,
            fragments: fragments.iter().map(summarize).collect(),
            total_fragments: fragments.len(),
            total_records,
            data_types,
            loaded,
        })
    }

    /// Insert every fragment's records into its `<type>_data` collection,
    /// tagged with the source and load time.
    async fn load(&self, source_id: &str, fragments: &[Fragment]) -> Result<IndexMap<String, usize>> {
        let uploaded_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut batches: IndexMap<String, Vec<Record>> = IndexMap::new();
        for fragment in fragments {
            let batch = batches
                .entry(fragment.fragment_type.collection_name())
                .or_default();
            for mut record in fragment.effective_records() {
                record.insert(SOURCE_FIELD.to_string(), Value::from(source_id));
                record.insert(UPLOADED_AT_FIELD.to_string(), Value::from(uploaded_at.as_str()));
                batch.push(record);
            }
        }

        let mut loaded = IndexMap::new();
        for (collection, records) in batches {
            if records.is_empty() {
                continue;
            }
            let count = self
                .store
                .insert_many(&collection, records)
                .await
                .map_err(|e| EtlError::Store(e.to_string()))?;
            debug!(collection = %collection, count, "loaded records");
            loaded.insert(collection, count);
        }
        Ok(loaded)
    }
}

fn schema_types(fragments: &[Fragment]) -> Vec<FragmentType> {
    let mut types: Vec<FragmentType> = fragments.iter().map(|f| f.fragment_type).collect();
    types.sort();
    types.dedup();
    types
}

fn summarize(fragment: &Fragment) -> FragmentSummary {
    let records = fragment.effective_records();
    FragmentSummary {
        fragment_type: fragment.fragment_type,
        start_line: fragment.start_line,
        end_line: fragment.end_line,
        record_count: records.len(),
        repaired: fragment.repaired,
        sample_records: records.into_iter().take(SAMPLE_RECORDS).collect(),
    }
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keep a copy of an uploaded document under
/// `<upload_dir>/<source_id>/<timestamp>_<filename>`.
pub fn archive_upload(
    upload_dir: &Path,
    source_id: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let safe_name = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect()
    };
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let dir = upload_dir.join(safe_name(source_id));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create upload dir {}", dir.display()))?;
    let path = dir.join(format!(
        "{}_{}",
        Utc::now().format("%Y%m%dT%H%M%S%.3f"),
        safe_name(base)
    ));
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
