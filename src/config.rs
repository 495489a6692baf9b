use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub translator: TranslatorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["txt".to_string(), "md".to_string(), "pdf".to_string()]
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}

impl IngestConfig {
    /// Whether a file name carries one of the allowed extensions
    /// (case-insensitive).
    pub fn is_allowed(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Per-collection cap on returned records.
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            result_limit: default_result_limit(),
        }
    }
}

fn default_result_limit() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranslatorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_translator_url")]
    pub url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_translator_url(),
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_translator_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}

impl TranslatorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8001".to_string()
}

impl Config {
    /// Configuration with every default, backed by the given database file.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            translator: TranslatorConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.query.result_limit < 1 {
        anyhow::bail!("query.result_limit must be >= 1");
    }

    if config.ingest.allowed_extensions.is_empty() {
        anyhow::bail!("ingest.allowed_extensions must not be empty");
    }

    match config.translator.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.translator.model.is_none() {
                anyhow::bail!(
                    "translator.model must be specified when provider is '{}'",
                    config.translator.provider
                );
            }
            if config.translator.timeout_secs == 0 {
                anyhow::bail!("translator.timeout_secs must be > 0");
            }
        }
        other => anyhow::bail!(
            "Unknown translator provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    Ok(config)
}
