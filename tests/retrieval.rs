use std::fs;
use std::path::Path;
use std::sync::Mutex;

use assist_harness::config::{ChunkingConfig, Config, RetrievalConfig, SourceConfig};
use assist_harness::error::AssistError;
use assist_harness::progress::{IndexEvent, IndexProgressReporter, NoProgress};
use assist_harness::retrieval::local::LocalProvider;
use assist_harness::retrieval::{
    create_provider, retrieve, Payload, ProviderKind, ProviderSettings, RequestKind,
    RetrievalOutcome, RetrievalProvider,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collect(Mutex<Vec<IndexEvent>>);

impl IndexProgressReporter for Collect {
    fn report(&self, event: IndexEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn local_provider(root: &Path, min_score: f64) -> LocalProvider {
    let retrieval = RetrievalConfig {
        provider: "local".into(),
        min_score,
        ..RetrievalConfig::default()
    };
    LocalProvider::new(
        ProviderSettings::from_config(&retrieval, ProviderKind::Local),
        SourceConfig {
            root: Some(root.to_path_buf()),
            ..SourceConfig::default()
        },
        ChunkingConfig::default(),
    )
}

#[tokio::test]
async fn test_local_rate_limiting_scenario() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("spec.txt"),
        "The system uses a token bucket for rate limiting.",
    )
    .unwrap();
    fs::write(
        tmp.path().join("notes.md"),
        "Deployment happens on Kubernetes with Docker images.",
    )
    .unwrap();

    let provider = local_provider(tmp.path(), 0.08);
    let reporter = Collect::default();
    let summary = provider
        .initialize(&reporter, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.chunks, 2);
    assert!(provider.is_ready());

    let payload = provider.build_payload("rate limiting").await.unwrap();
    let context = payload.context().expect("context expected");
    assert!(context.starts_with("Source: spec.txt (score "));
    assert!(context.contains("token bucket"));
    assert!(!context.contains("Kubernetes"));

    let score: f64 = context
        .split("(score ")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .unwrap()
        .parse()
        .unwrap();
    assert!(score >= 0.08);

    let events = reporter.0.lock().unwrap();
    assert!(matches!(
        events.last(),
        Some(IndexEvent::Status { message }) if message.starts_with("Local index ready")
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, IndexEvent::Progress { percent: 100, .. })));
}

#[tokio::test]
async fn test_empty_corpus_is_ready_but_empty() {
    let tmp = TempDir::new().unwrap();
    let provider = local_provider(tmp.path(), 0.08);
    let summary = provider
        .initialize(&NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.chunks, 0);
    assert!(provider.is_ready());
    assert_eq!(provider.build_payload("anything").await.unwrap(), Payload::Empty);
}

#[tokio::test]
async fn test_missing_root_fails_initialize() {
    let tmp = TempDir::new().unwrap();
    let provider = local_provider(&tmp.path().join("does-not-exist"), 0.08);
    let err = provider
        .initialize(&NoProgress, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AssistError::Retrieval(_)));
    assert!(!provider.is_ready());
}

#[tokio::test]
async fn test_below_threshold_yields_no_context() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("spec.txt"),
        "The system uses a token bucket for rate limiting.",
    )
    .unwrap();

    let provider = local_provider(tmp.path(), 0.99);
    provider
        .initialize(&NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    // One shared term out of many keeps the cosine well under 0.99.
    assert_eq!(provider.build_payload("token").await.unwrap(), Payload::Empty);
}

#[tokio::test]
async fn test_unseen_terms_match_nothing() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.txt"), "alpha beta gamma").unwrap();

    let provider = local_provider(tmp.path(), 0.0);
    provider
        .initialize(&NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        retrieve(&provider, RequestKind::FollowUp, "zeta omega").await,
        RetrievalOutcome::Empty
    );
}

#[tokio::test]
async fn test_cancelled_initialize_keeps_previous_state() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.txt"), "alpha beta gamma").unwrap();

    let provider = local_provider(tmp.path(), 0.0);
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(provider.initialize(&NoProgress, &cancel).await.is_err());
    assert!(!provider.is_ready());
}

#[tokio::test]
async fn test_reinitialize_replaces_index() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.txt"), "alpha beta gamma").unwrap();

    let provider = local_provider(tmp.path(), 0.0);
    provider
        .initialize(&NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert!(provider.build_payload("delta").await.unwrap().is_empty());

    fs::write(tmp.path().join("b.txt"), "delta epsilon").unwrap();
    provider
        .initialize(&NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(provider.chunk_count().await, 2);
    let payload = provider.build_payload("delta").await.unwrap();
    assert!(payload.context().unwrap().contains("Source: b.txt"));
}

#[tokio::test]
async fn test_disabled_provider_never_augments() {
    let config = Config::minimal();
    let provider = create_provider(ProviderKind::Disabled, &config);
    assert!(!provider.is_ready());
    assert_eq!(
        retrieve(provider.as_ref(), RequestKind::Audio, "anything").await,
        RetrievalOutcome::Empty
    );
}
