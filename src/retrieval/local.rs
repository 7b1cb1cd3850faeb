//! Local lexical retrieval backend.
//!
//! Reads files from `retrieval.source`, chunks them with
//! [`chunk_text`](crate::chunk::chunk_text) and serves cosine queries from a
//! [`LexicalIndex`]. Each `initialize` builds a fresh index and swaps it in
//! whole; queries running meanwhile keep using the previous one.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, SourceConfig};
use crate::error::{AssistError, AssistResult};
use crate::progress::{format_number, report_status, report_step, IndexProgressReporter};

use super::lexical::{LexicalIndex, LexicalIndexBuilder};
use super::source::{load_source_files, load_source_text};
use super::{
    format_context, rank_hits, IndexSummary, Payload, ProviderKind, ProviderSettings,
    RetrievalProvider,
};

pub struct LocalProvider {
    settings: ProviderSettings,
    source: SourceConfig,
    chunking: ChunkingConfig,
    index: RwLock<Arc<LexicalIndex>>,
    ready: AtomicBool,
}

impl LocalProvider {
    pub fn new(settings: ProviderSettings, source: SourceConfig, chunking: ChunkingConfig) -> Self {
        Self {
            settings,
            source,
            chunking,
            index: RwLock::new(Arc::new(LexicalIndex::default())),
            ready: AtomicBool::new(false),
        }
    }

    /// Number of chunks in the current index.
    pub async fn chunk_count(&self) -> usize {
        self.index.read().await.len()
    }
}

#[async_trait]
impl RetrievalProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
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
        report_status(reporter, "Scanning local documents...");
        let files = load_source_files(&self.source).await?;
        let total = files.len();

        let mut builder = LexicalIndexBuilder::new();
        let mut indexed_files = 0;

        for (i, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AssistError::Retrieval("indexing cancelled".into()));
            }

            if let Some(text) = load_source_text(file, self.source.max_file_bytes).await {
                let chunks = chunk_text(&text, self.chunking.chunk_chars, self.chunking.overlap_chars);
                if !chunks.is_empty() {
                    indexed_files += 1;
                }
                for chunk in chunks {
                    builder.add_chunk(&file.source_id, chunk);
                }
            }

            report_step(reporter, i + 1, total, file.source_id.clone());
        }

        let index = builder.finish();
        let summary = IndexSummary {
            files: indexed_files,
            chunks: index.len(),
        };

        *self.index.write().await = Arc::new(index);
        self.ready.store(true, Ordering::Release);

        let status = if summary.chunks == 0 {
            "Local index ready (no indexable content).".to_string()
        } else {
            format!(
                "Local index ready: {} chunks from {} files.",
                format_number(summary.chunks as u64),
                format_number(summary.files as u64)
            )
        };
        info!(files = summary.files, chunks = summary.chunks, "local index built");
        report_step(reporter, total, total, status.clone());
        report_status(reporter, status);

        Ok(summary)
    }

    async fn build_payload(&self, query: &str) -> AssistResult<Payload> {
        let index = Arc::clone(&*self.index.read().await);
        let ranked = rank_hits(index.score(query), self.settings.min_score, self.settings.top_k);

        Ok(format_context(&ranked, self.settings.max_context_chars)
            .map(Payload::Context)
            .unwrap_or(Payload::Empty))
    }
}
