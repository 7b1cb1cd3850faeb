//! TOML configuration parsing.
//!
//! Every section is optional; a missing field falls back to the default
//! function named in its `#[serde(default = ...)]` attribute. Validation
//! happens once in [`load_config`] so that the rest of the crate can rely on
//! sane values (non-zero chunk size, known provider name, and so on).
//!
//! API keys never live in the file itself. Each HTTP-backed section names
//! the environment variable to read the key from (`OPENAI_API_KEY` by
//! default).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retrieval::ProviderKind;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    /// A configuration made entirely of defaults: retrieval disabled,
    /// streaming off, server on localhost.
    pub fn minimal() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared opaque token. When set, `/ws` and `/frame` require it.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_frame_content_type")]
    pub frame_content_type: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            log_level: default_log_level(),
            frame_content_type: default_frame_content_type(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_frame_content_type() -> String {
    "image/png".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Recording is stopped and processed automatically after this long.
    #[serde(default = "default_max_recording_secs")]
    pub max_recording_secs: u64,
    /// Audio artifacts shorter than this many bytes are treated as silence.
    #[serde(default = "default_min_audio_bytes")]
    pub min_audio_bytes: usize,
    /// Maximum number of history turns kept. `0` keeps everything.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_recording_secs: default_max_recording_secs(),
            min_audio_bytes: default_min_audio_bytes(),
            max_history: default_max_history(),
        }
    }
}

impl SessionConfig {
    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs)
    }
}

fn default_max_recording_secs() -> u64 {
    120
}
fn default_min_audio_bytes() -> usize {
    2048
}
fn default_max_history() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fps: default_fps(),
        }
    }
}

impl StreamConfig {
    /// Frames per second, clamped to `1..=30`.
    pub fn effective_fps(&self) -> u32 {
        self.fps.clamp(1, 30)
    }
}

fn default_fps() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `disabled`, `local`, `embedding` or `managed`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_true")]
    pub use_for_audio: bool,
    #[serde(default = "default_true")]
    pub use_for_screenshot: bool,
    #[serde(default = "default_true")]
    pub use_for_follow_up: bool,
    #[serde(default = "default_query_max_chars")]
    pub query_max_chars: usize,
    /// Used when the history-derived query comes out empty.
    #[serde(default)]
    pub default_query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub managed: ManagedStoreConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            use_for_audio: true,
            use_for_screenshot: true,
            use_for_follow_up: true,
            query_max_chars: default_query_max_chars(),
            default_query: String::new(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_context_chars: default_max_context_chars(),
            source: SourceConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            managed: ManagedStoreConfig::default(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_true() -> bool {
    true
}
fn default_query_max_chars() -> usize {
    1000
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.08
}
fn default_max_context_chars() -> usize {
    6000
}

/// Where indexable documents come from. Shared by every retrieval backend.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// File extensions (without the dot) to index. Empty means the built-in
    /// allow-list.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: None,
            extensions: Vec::new(),
            exclude_globs: Vec::new(),
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_max_files() -> usize {
    2000
}
fn default_max_file_bytes() -> u64 {
    1_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_chunk_overlap(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_embedding_model(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagedStoreConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_store_name")]
    pub store_name: String,
    /// Upper bound on waiting for the store to finish processing uploads.
    #[serde(default = "default_index_timeout_secs")]
    pub index_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ManagedStoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
            store_name: default_store_name(),
            index_timeout_secs: default_index_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_upload_timeout_secs(),
        }
    }
}

fn default_store_name() -> String {
    "assist-harness".to_string()
}
fn default_index_timeout_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_upload_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_audio_prompt")]
    pub audio_prompt: String,
    #[serde(default = "default_screenshot_prompt")]
    pub screenshot_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            system_prompt: default_system_prompt(),
            audio_prompt: default_audio_prompt(),
            screenshot_prompt: default_screenshot_prompt(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-audio-preview".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_system_prompt() -> String {
    "You are a concise assistant. Answer the user's question directly; \
     use the reference material only when it is relevant."
        .to_string()
}
fn default_audio_prompt() -> String {
    "The first clip is my microphone, the second is my system audio. \
     Answer the question being asked."
        .to_string()
}
fn default_screenshot_prompt() -> String {
    "Answer the question or solve the problem shown on this screen.".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CaptureConfig {
    /// Program and arguments whose stdout is one screenshot image.
    /// Empty disables screen capture.
    #[serde(default)]
    pub screenshot_command: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let retrieval = &config.retrieval;

    let kind = ProviderKind::from_config(retrieval)?;

    if retrieval.chunking.chunk_chars == 0 {
        anyhow::bail!("retrieval.chunking.chunk_chars must be > 0");
    }
    if retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if retrieval.query_max_chars == 0 {
        anyhow::bail!("retrieval.query_max_chars must be > 0");
    }
    if !(0.0..=1.0).contains(&retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [0.0, 1.0]");
    }
    if kind != ProviderKind::Disabled && retrieval.source.root.is_none() {
        anyhow::bail!(
            "retrieval.source.root must be set when provider is '{}'",
            retrieval.provider
        );
    }
    if retrieval.embedding.batch_size == 0 {
        anyhow::bail!("retrieval.embedding.batch_size must be > 0");
    }
    if config.session.max_recording_secs == 0 {
        anyhow::bail!("session.max_recording_secs must be > 0");
    }

    Ok(())
}
