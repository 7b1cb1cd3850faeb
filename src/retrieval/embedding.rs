//! Remote embedding retrieval backend.
//!
//! Chunks local files exactly like the lexical backend, then embeds every
//! chunk through an OpenAI-compatible `POST {base_url}/embeddings`
//! endpoint. Queries are embedded once and ranked by cosine similarity.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 401/403 → fail immediately (credentials rejected)
//! - Other 4xx → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, EmbeddingConfig, SourceConfig};
use crate::error::{AssistError, AssistResult};
use crate::progress::{format_number, report_status, report_step, IndexProgressReporter};

use super::source::{load_source_files, load_source_text};
use super::{
    format_context, rank_hits, IndexSummary, Payload, ProviderKind, ProviderSettings,
    RankedChunk, RetrievalProvider,
};

#[derive(Debug)]
struct EmbeddedChunk {
    source_id: String,
    text: String,
    vector: Vec<f32>,
    norm: f32,
}

#[derive(Debug, Default)]
struct EmbeddedIndex {
    chunks: Vec<EmbeddedChunk>,
}

pub struct RemoteEmbeddingProvider {
    settings: ProviderSettings,
    source: SourceConfig,
    chunking: ChunkingConfig,
    config: EmbeddingConfig,
    index: RwLock<Arc<EmbeddedIndex>>,
    ready: AtomicBool,
}

impl RemoteEmbeddingProvider {
    pub fn new(
        settings: ProviderSettings,
        source: SourceConfig,
        chunking: ChunkingConfig,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            settings,
            source,
            chunking,
            config,
            index: RwLock::new(Arc::new(EmbeddedIndex::default())),
            ready: AtomicBool::new(false),
        }
    }

    fn api_key(&self) -> AssistResult<String> {
        std::env::var(&self.config.api_key_env).map_err(|_| {
            AssistError::Retrieval(format!(
                "{} environment variable not set",
                self.config.api_key_env
            ))
        })
    }

    fn client(&self) -> AssistResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| AssistError::Retrieval(e.to_string()))
    }
}

#[async_trait]
impl RetrievalProvider for RemoteEmbeddingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteEmbedding
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn initialize(
        &self,
        reporter: &dyn IndexProgressReporter,
        cancel: &CancellationToken,
    ) -> AssistResult<IndexSummary> {
        let api_key = self.api_key()?;
        let client = self.client()?;

        report_status(reporter, "Scanning documents for embedding...");
        let files = load_source_files(&self.source).await?;

        let mut pending: Vec<(String, String)> = Vec::new();
        let mut indexed_files = 0;
        for file in &files {
            if let Some(text) = load_source_text(file, self.source.max_file_bytes).await {
                let chunks = chunk_text(&text, self.chunking.chunk_chars, self.chunking.overlap_chars);
                if !chunks.is_empty() {
                    indexed_files += 1;
                }
                pending.extend(chunks.into_iter().map(|c| (file.source_id.clone(), c)));
            }
        }

        let total = pending.len();
        let mut chunks = Vec::with_capacity(total);

        for batch in pending.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                return Err(AssistError::Retrieval("indexing cancelled".into()));
            }

            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let vectors = embed_texts(&client, &self.config, &api_key, &texts).await?;
            if vectors.len() != batch.len() {
                return Err(AssistError::Retrieval(format!(
                    "embedding response has {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }

            for ((source_id, text), vector) in batch.iter().zip(vectors) {
                let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                chunks.push(EmbeddedChunk {
                    source_id: source_id.clone(),
                    text: text.clone(),
                    vector,
                    norm,
                });
            }

            report_step(
                reporter,
                chunks.len(),
                total,
                format!("Embedded {} / {} chunks", chunks.len(), total),
            );
        }

        let summary = IndexSummary {
            files: indexed_files,
            chunks: chunks.len(),
        };
        *self.index.write().await = Arc::new(EmbeddedIndex { chunks });
        self.ready.store(true, Ordering::Release);

        let status = if summary.chunks == 0 {
            "Embedding index ready (no indexable content).".to_string()
        } else {
            format!(
                "Embedding index ready: {} chunks from {} files.",
                format_number(summary.chunks as u64),
                format_number(summary.files as u64)
            )
        };
        info!(files = summary.files, chunks = summary.chunks, model = %self.config.model, "embedding index built");
        report_step(reporter, total, total, status.clone());
        report_status(reporter, status);

        Ok(summary)
    }

    async fn build_payload(&self, query: &str) -> AssistResult<Payload> {
        let index = Arc::clone(&*self.index.read().await);
        if index.chunks.is_empty() {
            return Ok(Payload::Empty);
        }

        let api_key = self.api_key()?;
        let client = self.client()?;
        let query_vector = embed_texts(&client, &self.config, &api_key, &[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AssistError::Retrieval("Empty embedding response".into()))?;

        let query_norm = query_vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        let hits: Vec<RankedChunk> = index
            .chunks
            .iter()
            .map(|chunk| RankedChunk {
                source_id: chunk.source_id.clone(),
                text: chunk.text.clone(),
                score: cosine_with_norms(&query_vector, query_norm, &chunk.vector, chunk.norm)
                    as f64,
            })
            .collect();

        let ranked = rank_hits(hits, self.settings.min_score, self.settings.top_k);
        Ok(format_context(&ranked, self.settings.max_context_chars)
            .map(Payload::Context)
            .unwrap_or(Payload::Empty))
    }
}

/// Cosine similarity with precomputed norms.
///
/// Returns `0.0` for vectors of different lengths or with a zero norm.
pub fn cosine_with_norms(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / denom
}

/// Call the embeddings endpoint with retry/backoff.
async fn embed_texts(
    client: &reqwest::Client,
    config: &EmbeddingConfig,
    api_key: &str,
    texts: &[String],
) -> AssistResult<Vec<Vec<f32>>> {
    let url = format!("{}/embeddings", config.base_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "model": config.model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| AssistError::Retrieval(e.to_string()))?;
                    return parse_embedding_response(&json);
                }

                let body_text = response.text().await.unwrap_or_default();

                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return Err(AssistError::Retrieval(format!(
                        "embedding credentials rejected ({}): {}",
                        status, body_text
                    )));
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(%status, attempt, "embedding request failed; retrying");
                    last_err = Some(format!("Embedding API error {}: {}", status, body_text));
                    continue;
                }

                return Err(AssistError::Retrieval(format!(
                    "Embedding API error {}: {}",
                    status, body_text
                )));
            }
            Err(e) => {
                warn!(error = %e, attempt, "embedding request failed; retrying");
                last_err = Some(e.to_string());
                continue;
            }
        }
    }

    Err(AssistError::Retrieval(last_err.unwrap_or_else(|| {
        "Embedding failed after retries".to_string()
    })))
}

/// Extract `data[].embedding` arrays, ordered by their `index` field.
fn parse_embedding_response(json: &serde_json::Value) -> AssistResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| AssistError::Retrieval("Invalid embedding response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| AssistError::Retrieval("Invalid embedding response: missing embedding".into()))?;

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}
