use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::progress::ProgressMode;
use crate::retrieval::{create_provider, retrieve, Payload, ProviderKind, RequestKind, RetrievalOutcome};

/// Build the configured retrieval index once and report what went in.
pub async fn run_index(config: &Config, progress: ProgressMode) -> Result<()> {
    let kind = ProviderKind::from_config(&config.retrieval)?;
    if kind == ProviderKind::Disabled {
        bail!("Retrieval is disabled. Set [retrieval] provider in config.");
    }

    let provider = create_provider(kind, config);
    let reporter = progress.reporter();
    let summary = provider
        .initialize(reporter.as_ref(), &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to build {} index", kind.as_str()))?;

    println!("index {}", kind.as_str());
    println!("  files: {}", summary.files);
    println!("  chunks: {}", summary.chunks);
    Ok(())
}

/// Build the index, run one follow-up style lookup and print the payload.
pub async fn run_query(config: &Config, text: &str, progress: ProgressMode) -> Result<()> {
    let kind = ProviderKind::from_config(&config.retrieval)?;
    if kind == ProviderKind::Disabled {
        bail!("Retrieval is disabled. Set [retrieval] provider in config.");
    }

    let provider = create_provider(kind, config);
    let reporter = progress.reporter();
    provider
        .initialize(reporter.as_ref(), &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to build {} index", kind.as_str()))?;

    let query: String = text
        .trim()
        .chars()
        .take(config.retrieval.query_max_chars)
        .collect();

    match retrieve(provider.as_ref(), RequestKind::FollowUp, &query).await {
        RetrievalOutcome::Found(Payload::Context(context)) => println!("{}", context),
        RetrievalOutcome::Found(Payload::Tools(tools)) => {
            println!("{}", serde_json::to_string_pretty(&tools)?)
        }
        RetrievalOutcome::Found(Payload::Empty) | RetrievalOutcome::Empty => {
            println!("No matching context.")
        }
        RetrievalOutcome::Failed(reason) => bail!("Query failed: {}", reason),
    }
    Ok(())
}
