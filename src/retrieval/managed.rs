//! Managed document store backend.
//!
//! Uploads source files to an OpenAI-compatible hosted vector store and
//! answers every query with a `file_search` tool descriptor pointing at
//! that store. The model provider does the ranking; this backend never
//! returns inline context.
//!
//! Initialization:
//! 1. `POST /vector_stores` creates the store.
//! 2. Each file goes through `POST /files` (multipart, purpose
//!    `assistants`) and `POST /vector_stores/{id}/files`. Byte-identical
//!    files are uploaded once.
//! 3. `GET /vector_stores/{id}` is polled until no file is in progress or
//!    `index_timeout_secs` runs out. Running out is logged and the store is
//!    used as-is.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ManagedStoreConfig, SourceConfig};
use crate::error::{AssistError, AssistResult};
use crate::progress::{report_status, report_step, IndexProgressReporter};

use super::source::{load_source_bytes, load_source_files, SourceFile};
use super::{IndexSummary, Payload, ProviderKind, ProviderSettings, RetrievalProvider};

/// Share of the progress bar spent on uploads; the rest covers processing.
const UPLOAD_PERCENT: usize = 90;

pub struct ManagedStoreProvider {
    settings: ProviderSettings,
    source: SourceConfig,
    config: ManagedStoreConfig,
    store_id: RwLock<Option<String>>,
    ready: AtomicBool,
}

impl ManagedStoreProvider {
    pub fn new(settings: ProviderSettings, source: SourceConfig, config: ManagedStoreConfig) -> Self {
        Self {
            settings,
            source,
            config,
            store_id: RwLock::new(None),
            ready: AtomicBool::new(false),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn create_store(&self, client: &reqwest::Client, api_key: &str) -> AssistResult<String> {
        let resp = client
            .post(self.url("vector_stores"))
            .bearer_auth(api_key)
            .json(&serde_json::json!({ "name": self.config.store_name }))
            .send()
            .await
            .map_err(transport_error)?;
        let json = check_response(resp, "create vector store").await?;
        string_field(&json, "id")
    }

    async fn upload_file(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        store_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> AssistResult<()> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let resp = client
            .post(self.url("files"))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        let file_id = string_field(&check_response(resp, "upload file").await?, "id")?;

        let resp = client
            .post(self.url(&format!("vector_stores/{}/files", store_id)))
            .bearer_auth(api_key)
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(transport_error)?;
        check_response(resp, "attach file").await?;
        Ok(())
    }

    /// Poll until nothing is in progress. Returns `Timeout` when the bound
    /// is reached first.
    async fn wait_until_processed(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        store_id: &str,
        cancel: &CancellationToken,
    ) -> AssistResult<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.index_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let resp = client
                .get(self.url(&format!("vector_stores/{}", store_id)))
                .bearer_auth(api_key)
                .send()
                .await
                .map_err(transport_error)?;
            let json = check_response(resp, "poll vector store").await?;
            let in_progress = json
                .pointer("/file_counts/in_progress")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if in_progress == 0 {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(AssistError::Timeout(format!(
                    "{} files still processing after {}s",
                    in_progress, self.config.index_timeout_secs
                )));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AssistError::Retrieval("indexing cancelled".into()));
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Upload every file into `store_id` and wait for processing. Returns
    /// the number of files uploaded.
    async fn fill_store(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        store_id: &str,
        files: &[SourceFile],
        reporter: &dyn IndexProgressReporter,
        cancel: &CancellationToken,
    ) -> AssistResult<usize> {
        let total = files.len();
        let mut seen_digests = HashSet::new();
        let mut uploaded = 0;

        for (i, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AssistError::Retrieval("indexing cancelled".into()));
            }

            if let Some(bytes) = load_source_bytes(file, self.source.max_file_bytes).await {
                let digest = hex::encode(Sha256::digest(&bytes));
                if seen_digests.insert(digest) {
                    self.upload_file(client, api_key, store_id, &file.source_id, bytes)
                        .await?;
                    uploaded += 1;
                } else {
                    info!(file = %file.source_id, "skipping duplicate upload");
                }
            }

            report_step(
                reporter,
                (i + 1) * UPLOAD_PERCENT,
                total * 100,
                format!("Uploaded {}", file.source_id),
            );
        }

        report_status(reporter, "Waiting for the managed store to process files...");
        match self
            .wait_until_processed(client, api_key, store_id, cancel)
            .await
        {
            Ok(()) => {}
            Err(AssistError::Timeout(reason)) => {
                warn!(store_id = %store_id, %reason, "managed store indexing timed out; continuing");
                report_status(reporter, format!("Managed store still processing: {}", reason));
            }
            Err(e) => return Err(e),
        }

        Ok(uploaded)
    }

    /// Delete a store left incomplete by a failed initialization.
    async fn discard_store(&self, client: &reqwest::Client, api_key: &str, store_id: &str) {
        let result = match client
            .delete(self.url(&format!("vector_stores/{}", store_id)))
            .bearer_auth(api_key)
            .send()
            .await
        {
            Ok(resp) => check_response(resp, "delete vector store").await.map(|_| ()),
            Err(e) => Err(transport_error(e)),
        };
        match result {
            Ok(()) => info!(store_id = %store_id, "deleted incomplete managed store"),
            Err(e) => warn!(
                store_id = %store_id,
                error = %e,
                "failed to delete incomplete managed store; remove it manually"
            ),
        }
    }
}

#[async_trait]
impl RetrievalProvider for ManagedStoreProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ManagedStore
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
        let api_key = std::env::var(&self.config.api_key_env).map_err(|_| {
            AssistError::Retrieval(format!(
                "{} environment variable not set",
                self.config.api_key_env
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| AssistError::Retrieval(e.to_string()))?;

        report_status(reporter, "Scanning documents for upload...");
        let files = load_source_files(&self.source).await?;
        if files.is_empty() {
            *self.store_id.write().await = None;
            self.ready.store(true, Ordering::Release);
            report_step(reporter, 1, 1, "No documents to upload.".into());
            report_status(reporter, "Managed store ready (no indexable content).");
            return Ok(IndexSummary::default());
        }

        let store_id = self.create_store(&client, &api_key).await?;
        info!(store_id = %store_id, files = files.len(), "created managed store");

        let uploaded = match self
            .fill_store(&client, &api_key, &store_id, &files, reporter, cancel)
            .await
        {
            Ok(uploaded) => uploaded,
            Err(e) => {
                self.discard_store(&client, &api_key, &store_id).await;
                return Err(e);
            }
        };

        *self.store_id.write().await = Some(store_id);
        self.ready.store(true, Ordering::Release);

        let status = format!("Managed store ready: {} files.", uploaded);
        report_step(reporter, 1, 1, status.clone());
        report_status(reporter, status);

        Ok(IndexSummary {
            files: uploaded,
            chunks: 0,
        })
    }

    async fn build_payload(&self, _query: &str) -> AssistResult<Payload> {
        if !self.is_ready() {
            return Ok(Payload::Empty);
        }
        Ok(self
            .store_id
            .read()
            .await
            .as_deref()
            .map(|id| file_search_tool(id, self.settings.top_k))
            .map(Payload::Tools)
            .unwrap_or(Payload::Empty))
    }
}

/// Tool descriptor handed to the model for a store.
pub fn file_search_tool(store_id: &str, max_results: usize) -> serde_json::Value {
    serde_json::json!({
        "type": "file_search",
        "vector_store_ids": [store_id],
        "max_num_results": max_results,
    })
}

fn transport_error(e: reqwest::Error) -> AssistError {
    if e.is_timeout() {
        AssistError::Timeout(e.to_string())
    } else {
        AssistError::Retrieval(format!("managed store unreachable: {}", e))
    }
}

async fn check_response(resp: reqwest::Response, action: &str) -> AssistResult<serde_json::Value> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| AssistError::Retrieval(format!("{}: invalid response: {}", action, e)));
    }

    let body = resp.text().await.unwrap_or_default();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(AssistError::Retrieval(format!(
            "{}: credentials rejected ({})",
            action, status
        )));
    }
    Err(AssistError::Retrieval(format!("{}: {} {}", action, status, body)))
}

fn string_field(json: &serde_json::Value, field: &str) -> AssistResult<String> {
    json.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AssistError::Retrieval(format!("response is missing '{}'", field)))
}
