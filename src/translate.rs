//! Natural-language → structured query translation.
//!
//! A [`QueryTranslator`] turns a question plus the source's current schema
//! into query *text*. Parsing that text is the query service's job, so a
//! model that answers with prose surfaces as a `QueryParse` error carrying
//! the literal reply.
//!
//! - **[`OllamaTranslator`]** posts to Ollama's `/api/chat` with retry and
//!   backoff on 429/5xx and network errors.
//! - **[`DisabledTranslator`]** rejects every request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use etl_harness_core::schema::SourceSchema;
use etl_harness_core::EtlError;

use crate::config::TranslatorConfig;

const SYSTEM_PROMPT: &str = r#"You translate questions about a document database into a single JSON query object.

Rules:
1. Reply with exactly one JSON object and nothing else: no markdown, no explanation.
2. Use double quotes for every key and string value.
3. The schema describes the records. Query record fields directly, never schema keys.
   Question: "products with price over 100"
   Correct: {"operation": "find", "filter": {"price": {"$gt": 100}}, "projection": {"_id": 0}}
   Wrong:   {"filter": {"collections.json_data.price": {"$gt": 100}}}
4. Use comparison operators ($gt, $gte, $lt, $lte, $eq, $ne, $in, $nin, $regex), never $expr.
5. For grouping or counting use {"operation": "aggregate", "pipeline": [...]} with
   $match, $group, $sort, $limit, $skip, $project, $unwind or $count stages.
6. Every "find" includes "projection": {"_id": 0}."#;

#[async_trait]
pub trait QueryTranslator: Send + Sync {
    fn name(&self) -> &str;

    /// Produce query text for `question` against `schema`.
    async fn translate(&self, question: &str, schema: &SourceSchema) -> Result<String>;
}

pub fn create_translator(config: &TranslatorConfig) -> Result<Arc<dyn QueryTranslator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTranslator)),
        "ollama" => Ok(Arc::new(OllamaTranslator::new(config)?)),
        other => bail!("Unknown translator provider: {}", other),
    }
}

pub struct DisabledTranslator;

#[async_trait]
impl QueryTranslator for DisabledTranslator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn translate(&self, _question: &str, _schema: &SourceSchema) -> Result<String> {
        Err(EtlError::Translation(
            "natural-language queries are disabled (set [translator] provider)".to_string(),
        )
        .into())
    }
}

pub struct OllamaTranslator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_retries: u32,
}

impl OllamaTranslator {
    pub fn new(config: &TranslatorConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("translator.model required"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/chat", config.url.trim_end_matches('/')),
            model,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl QueryTranslator for OllamaTranslator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn translate(&self, question: &str, schema: &SourceSchema) -> Result<String> {
        let body = json!({
            "model": self.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(question, schema)?},
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s, ... capped at 32s
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.client.post(&self.endpoint).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        let content = json
                            .pointer("/message/content")
                            .and_then(Value::as_str)
                            .context("Invalid Ollama response: missing message.content")?;
                        debug!(model = %self.model, reply = content, "translator reply");
                        return Ok(content.to_string());
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "Ollama request failed, retrying");
                        last_err = Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Ollama request failed, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Translation failed after retries")))
    }
}

/// The question plus the parts of the schema a model needs: collection
/// names, field names, types and samples.
fn user_prompt(question: &str, schema: &SourceSchema) -> Result<String> {
    let collections = serde_json::to_string_pretty(&json!({ "collections": schema.collections }))?;
    Ok(format!(
        "Schema:\n{}\n\nQuestion:\n\"{}\"\n\nReply with the JSON query object now.",
        collections, question
    ))
}

/// Cut the query object out of a model reply: drop markdown fences, then
/// keep the outermost `{...}`.
pub fn extract_query_json(reply: &str) -> &str {
    let mut text = reply.trim();
    if let Some((_, rest)) = text.split_once("```json") {
        text = rest.split("```").next().unwrap_or(rest);
    } else if let Some((_, rest)) = text.split_once("```") {
        text = rest.split("```").next().unwrap_or(rest);
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}
