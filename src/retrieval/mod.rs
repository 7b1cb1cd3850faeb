//! Retrieval provider abstraction.
//!
//! Defines the [`RetrievalProvider`] trait and its backends:
//! - **[`DisabledProvider`]**: never ready, never augments.
//! - **[`LocalProvider`](local::LocalProvider)**: in-process TF-IDF index
//!   over local files.
//! - **[`RemoteEmbeddingProvider`](embedding::RemoteEmbeddingProvider)**:
//!   chunks local files and ranks them by cosine similarity of vectors from
//!   an OpenAI-compatible embeddings endpoint.
//! - **[`ManagedStoreProvider`](managed::ManagedStoreProvider)**: uploads
//!   files to a hosted vector store and hands the model a `file_search` tool
//!   instead of inline text.
//!
//! # Provider Selection
//!
//! The backend is chosen once, before anything is constructed, by
//! [`ProviderKind::from_config`]:
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledProvider`] |
//! | `"local"` | [`local::LocalProvider`] |
//! | `"embedding"` | [`embedding::RemoteEmbeddingProvider`] |
//! | `"managed"` | [`managed::ManagedStoreProvider`] |
//!
//! # Payloads
//!
//! A backend answers a query with a [`Payload`]: inline context text, an
//! opaque tool descriptor, or nothing. "No match" is [`Payload::Empty`],
//! never an error. Only transport or credential failures come back as
//! `Err`, and [`retrieve`] turns those into [`RetrievalOutcome::Failed`]
//! so that a broken index degrades to an unaugmented answer.

pub mod embedding;
pub mod lexical;
pub mod local;
pub mod managed;
pub mod source;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetrievalConfig};
use crate::error::AssistResult;
use crate::progress::IndexProgressReporter;

/// Backend selected by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Disabled,
    Local,
    RemoteEmbedding,
    ManagedStore,
}

impl ProviderKind {
    pub fn from_config(config: &RetrievalConfig) -> anyhow::Result<Self> {
        match config.provider.trim().to_ascii_lowercase().as_str() {
            "disabled" | "none" | "" => Ok(Self::Disabled),
            "local" => Ok(Self::Local),
            "embedding" => Ok(Self::RemoteEmbedding),
            "managed" => Ok(Self::ManagedStore),
            other => anyhow::bail!(
                "Unknown retrieval provider: '{}'. Must be disabled, local, embedding, or managed.",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Local => "local",
            Self::RemoteEmbedding => "embedding",
            Self::ManagedStore => "managed",
        }
    }
}

/// Which kind of assist request is asking for context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Audio,
    Screenshot,
    FollowUp,
}

/// Immutable per-provider settings.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub use_for_audio: bool,
    pub use_for_screenshot: bool,
    pub use_for_follow_up: bool,
    pub query_max_chars: usize,
    pub default_query: String,
    pub top_k: usize,
    pub min_score: f64,
    pub max_context_chars: usize,
}

impl ProviderSettings {
    pub fn from_config(config: &RetrievalConfig, kind: ProviderKind) -> Self {
        Self {
            enabled: kind != ProviderKind::Disabled,
            use_for_audio: config.use_for_audio,
            use_for_screenshot: config.use_for_screenshot,
            use_for_follow_up: config.use_for_follow_up,
            query_max_chars: config.query_max_chars,
            default_query: config.default_query.clone(),
            top_k: config.top_k,
            min_score: config.min_score,
            max_context_chars: config.max_context_chars,
        }
    }

    pub fn used_for(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Audio => self.use_for_audio,
            RequestKind::Screenshot => self.use_for_screenshot,
            RequestKind::FollowUp => self.use_for_follow_up,
        }
    }
}

/// Retrieval result attached to a model call. At most one of context or
/// tools is ever present.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Empty,
    Context(String),
    Tools(serde_json::Value),
}

impl Payload {
    pub fn context(&self) -> Option<&str> {
        match self {
            Payload::Context(text) => Some(text),
            _ => None,
        }
    }

    pub fn tools(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Tools(tools) => Some(tools),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

/// What the orchestrator gets back from [`retrieve`].
#[derive(Clone, Debug, PartialEq)]
pub enum RetrievalOutcome {
    Found(Payload),
    Empty,
    Failed(String),
}

impl RetrievalOutcome {
    /// The payload to attach, treating failures as no augmentation.
    pub fn into_payload(self) -> Payload {
        match self {
            RetrievalOutcome::Found(payload) => payload,
            RetrievalOutcome::Empty | RetrievalOutcome::Failed(_) => Payload::Empty,
        }
    }
}

/// Counts reported after a successful initialize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub files: usize,
    pub chunks: usize,
}

/// One ranked chunk, ready to be formatted into context.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedChunk {
    pub source_id: String,
    pub text: String,
    pub score: f64,
}

/// Line placed between chunks in formatted context.
pub const CHUNK_DELIMITER: &str = "---";

/// Concatenate ranked chunks into a context block of at most `max_chars`
/// characters.
///
/// Each chunk is rendered as a `Source: <file> (score X.XX)` header line
/// followed by its text. A header is never split: if it does not fit
/// together with at least one character of body, formatting stops. Bodies
/// may be truncated. Returns `None` when nothing fits.
pub fn format_context(ranked: &[RankedChunk], max_chars: usize) -> Option<String> {
    let mut out = String::new();
    let mut used = 0;

    for hit in ranked {
        let separator = if out.is_empty() {
            String::new()
        } else {
            format!("\n{}\n", CHUNK_DELIMITER)
        };
        let header = format!("Source: {} (score {:.2})\n", hit.source_id, hit.score);
        let overhead = separator.chars().count() + header.chars().count();

        let remaining = max_chars.saturating_sub(used);
        if overhead >= remaining {
            break;
        }

        let body_budget = remaining - overhead;
        let body_len = hit.text.chars().count();

        out.push_str(&separator);
        out.push_str(&header);
        if body_len <= body_budget {
            out.push_str(&hit.text);
            used += overhead + body_len;
        } else {
            out.extend(hit.text.chars().take(body_budget));
            break;
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Keep hits at or above `min_score`, sort by descending score (ties keep
/// their original order), and cut to `top_k`.
pub fn rank_hits(mut hits: Vec<RankedChunk>, min_score: f64, top_k: usize) -> Vec<RankedChunk> {
    hits.retain(|h| h.score > 0.0 && h.score >= min_score);
    // `sort_by` is stable, so equal scores stay in chunk order.
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);
    hits
}

/// Common contract for every retrieval backend.
#[async_trait]
pub trait RetrievalProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn settings(&self) -> &ProviderSettings;

    /// True once an index (possibly empty) has been built.
    fn is_ready(&self) -> bool;

    /// Build or rebuild the index.
    ///
    /// Publishes progress through `reporter` and finishes with a status
    /// event. An empty corpus is not an error. Fails with
    /// [`AssistError::Retrieval`](crate::error::AssistError::Retrieval) when
    /// the source is unreadable, the network is unreachable, or credentials
    /// are rejected.
    async fn initialize(
        &self,
        reporter: &dyn IndexProgressReporter,
        cancel: &CancellationToken,
    ) -> AssistResult<IndexSummary>;

    /// Look up context for `query`. Returns [`Payload::Empty`] when nothing
    /// matches.
    async fn build_payload(&self, query: &str) -> AssistResult<Payload>;
}

/// Provider used when retrieval is switched off.
pub struct DisabledProvider {
    settings: ProviderSettings,
}

impl DisabledProvider {
    pub fn new() -> Self {
        Self {
            settings: ProviderSettings::from_config(
                &RetrievalConfig::default(),
                ProviderKind::Disabled,
            ),
        }
    }
}

impl Default for DisabledProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetrievalProvider for DisabledProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Disabled
    }
    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }
    fn is_ready(&self) -> bool {
        false
    }
    async fn initialize(
        &self,
        _reporter: &dyn IndexProgressReporter,
        _cancel: &CancellationToken,
    ) -> AssistResult<IndexSummary> {
        Ok(IndexSummary::default())
    }
    async fn build_payload(&self, _query: &str) -> AssistResult<Payload> {
        Ok(Payload::Empty)
    }
}

/// Construct the provider for `kind`.
pub fn create_provider(kind: ProviderKind, config: &Config) -> Arc<dyn RetrievalProvider> {
    let retrieval = &config.retrieval;
    let settings = ProviderSettings::from_config(retrieval, kind);
    match kind {
        ProviderKind::Disabled => Arc::new(DisabledProvider::new()),
        ProviderKind::Local => Arc::new(local::LocalProvider::new(
            settings,
            retrieval.source.clone(),
            retrieval.chunking.clone(),
        )),
        ProviderKind::RemoteEmbedding => Arc::new(embedding::RemoteEmbeddingProvider::new(
            settings,
            retrieval.source.clone(),
            retrieval.chunking.clone(),
            retrieval.embedding.clone(),
        )),
        ProviderKind::ManagedStore => Arc::new(managed::ManagedStoreProvider::new(
            settings,
            retrieval.source.clone(),
            retrieval.managed.clone(),
        )),
    }
}

/// Ask `provider` for context on behalf of a `kind` request.
///
/// Skips the lookup when the provider is disabled, not ready, or not opted
/// into this request kind. A blank `query` falls back to the provider's
/// default query; if that is blank too, nothing is looked up.
pub async fn retrieve(
    provider: &dyn RetrievalProvider,
    kind: RequestKind,
    query: &str,
) -> RetrievalOutcome {
    let settings = provider.settings();
    if !settings.enabled || !settings.used_for(kind) || !provider.is_ready() {
        return RetrievalOutcome::Empty;
    }

    let query = if query.trim().is_empty() {
        settings.default_query.trim()
    } else {
        query
    };
    if query.is_empty() {
        return RetrievalOutcome::Empty;
    }

    match provider.build_payload(query).await {
        Ok(Payload::Empty) => RetrievalOutcome::Empty,
        Ok(payload) => RetrievalOutcome::Found(payload),
        Err(e) => RetrievalOutcome::Failed(e.to_string()),
    }
}
