use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::{ChunkParams, SizeUnit};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_unit")]
    pub unit: SizeUnit,
    /// Defaults to a fifth of `max_size` when unset.
    #[serde(default)]
    pub boundary_tolerance: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            overlap: default_overlap(),
            unit: default_unit(),
            boundary_tolerance: None,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        let params = ChunkParams::new(self.max_size, self.overlap, self.unit);
        match self.boundary_tolerance {
            Some(t) => params.with_tolerance(t),
            None => params,
        }
    }
}

fn default_max_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}
fn default_unit() -> SizeUnit {
    SizeUnit::Chars
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers. Each provider has its own default.
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: None,
            batch_size: default_batch_size(),
            max_batch_tokens: default_max_batch_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            parallelism: default_parallelism(),
            requests_per_minute: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_batch_tokens() -> usize {
    8000
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    32_000
}
fn default_parallelism() -> usize {
    2
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model label recorded on every index record.
    pub fn model_name(&self) -> String {
        match (&self.model, self.provider.as_str()) {
            (Some(m), _) => m.clone(),
            (None, "hash") => "fnv1a-hash".to_string(),
            (None, other) => other.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attach ACL tags to items and records.
    #[serde(default)]
    pub acl: bool,
    /// Extract page images and embed them alongside text.
    #[serde(default)]
    pub vision: bool,
    /// Principals granted on every item when ACL mode is on.
    #[serde(default)]
    pub default_acl: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            acl: false,
            vision: false,
            default_acl: Vec::new(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

fn default_write_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub filesystem: FilesystemSourceConfig,
    pub s3: Option<S3SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    /// Relative locators resolve against this directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for FilesystemSourceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack). Switches to path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for S3SourceConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

pub const PROVIDERS: &[&str] = &["disabled", "openai", "ollama", "azure-vision", "hash", "local"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints. Also called after CLI overrides are applied.
pub fn validate(config: &Config) -> Result<()> {
    config.chunking.params().validate()?;

    if config.pipeline.concurrency == 0 {
        bail!("pipeline.concurrency must be >= 1");
    }
    if config.index.write_timeout_secs == 0 {
        bail!("index.write_timeout_secs must be > 0");
    }

    let emb = &config.embedding;
    if !PROVIDERS.contains(&emb.provider.as_str()) {
        bail!(
            "Unknown embedding provider: '{}'. Must be one of: {}.",
            emb.provider,
            PROVIDERS.join(", ")
        );
    }

    if emb.is_enabled() {
        if emb.dims.is_none() || emb.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                emb.provider
            );
        }
        if emb.model.is_none() && emb.provider != "hash" {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                emb.provider
            );
        }
        if emb.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        if emb.max_batch_tokens == 0 {
            bail!("embedding.max_batch_tokens must be >= 1");
        }
        if emb.parallelism == 0 {
            bail!("embedding.parallelism must be >= 1");
        }
        if emb.backoff_base_ms > emb.backoff_max_ms {
            bail!(
                "embedding.backoff_base_ms ({}) must not exceed embedding.backoff_max_ms ({})",
                emb.backoff_base_ms,
                emb.backoff_max_ms
            );
        }
        if emb.requests_per_minute == Some(0) {
            bail!("embedding.requests_per_minute must be >= 1 when set");
        }
    }

    if config.pipeline.vision && !matches!(emb.provider.as_str(), "azure-vision" | "hash") {
        bail!(
            "pipeline.vision requires an embedding provider with image support \
             (azure-vision or hash), got '{}'",
            emb.provider
        );
    }

    Ok(())
}
