use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Model client settings: provider selection, queue shape, and spacing.
///
/// The default 6500 ms spacing keeps the service under a small-tier quota of
/// roughly 9 requests/minute.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_gen_model")]
    pub gen_model: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            embed_model: default_embed_model(),
            gen_model: default_gen_model(),
            queue_capacity: default_queue_capacity(),
            min_interval_ms: default_min_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-004".to_string()
}
fn default_gen_model() -> String {
    "gemini-1.5-flash".to_string()
}
fn default_queue_capacity() -> usize {
    50
}
fn default_min_interval_ms() -> u64 {
    6500
}
fn default_request_timeout_ms() -> u64 {
    300_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_http_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens.
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    /// Overlap budget in tokens carried between consecutive chunks.
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: default_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    512
}
fn default_overlap_tokens() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Texts per embed batch; each batch fans out concurrently into the
    /// model client queue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep between batches so one ingestion cannot exhaust the queue.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_batch_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Maximum sources per answer.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Similarity floor; candidates below it are discarded.
    #[serde(default = "default_min_relevance_score")]
    pub min_relevance_score: f32,
    /// Above this many embedded chunks the scan streams rows instead of
    /// materializing the whole set.
    #[serde(default = "default_scan_stream_threshold")]
    pub scan_stream_threshold: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_relevance_score: default_min_relevance_score(),
            scan_stream_threshold: default_scan_stream_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_relevance_score() -> f32 {
    0.3
}
fn default_scan_stream_threshold() -> i64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Sampling temperature. Clamped to the safety ceiling by the model
    /// client regardless of this value.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    1024
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
    "127.0.0.1:7431".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_tokens == 0 {
        anyhow::bail!("chunking.chunk_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.chunk_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.chunk_tokens");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_relevance_score) {
        anyhow::bail!("retrieval.min_relevance_score must be in [0.0, 1.0]");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.model.queue_capacity == 0 {
        anyhow::bail!("model.queue_capacity must be > 0");
    }
    match config.model.provider.as_str() {
        "gemini" | "mock" => {}
        other => anyhow::bail!("Unknown model provider: '{}'. Must be gemini or mock.", other),
    }
    Ok(())
}

impl Config {
    /// In-memory defaults with a database path, used by tests and by
    /// commands that can run without a config file.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            model: ModelConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}
