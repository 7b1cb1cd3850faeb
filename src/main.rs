//! # Assist Harness CLI (`assist`)
//!
//! ## Usage
//!
//! ```bash
//! assist --config ./config/assist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `assist serve` | Start the HTTP + WebSocket server |
//! | `assist index` | Build the configured retrieval index and print counts |
//! | `assist query "<text>"` | Print the context a question would be given |
//!
//! Logs go to stderr. `RUST_LOG` overrides `[server] log_level`.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use assist_harness::config::{self, Config};
use assist_harness::progress::ProgressMode;
use assist_harness::{index_cmd, server};

/// Assist Harness: retrieval-augmented answers about audio, screen and text.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/assist.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "assist", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/assist.toml`. When the file does not exist,
    /// built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/assist.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP + WebSocket server.
    Serve,

    /// Build the retrieval index once and print file and chunk counts.
    Index {
        /// Progress output on stderr.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show the context retrieval would attach to a question.
    Query {
        /// The question text.
        text: String,

        /// Progress output on stderr.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

fn progress_mode(arg: Option<ProgressArg>) -> ProgressMode {
    match arg {
        Some(ProgressArg::Off) => ProgressMode::Off,
        Some(ProgressArg::Human) => ProgressMode::Human,
        Some(ProgressArg::Json) => ProgressMode::Json,
        None => ProgressMode::default_for_tty(),
    }
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    init_logging(&cfg.server.log_level);

    if !cli.config.exists() {
        tracing::info!(path = %cli.config.display(), "config file not found; using defaults");
    }

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Index { progress } => {
            index_cmd::run_index(&cfg, progress_mode(progress)).await?;
        }
        Commands::Query { text, progress } => {
            index_cmd::run_query(&cfg, &text, progress_mode(progress)).await?;
        }
    }

    Ok(())
}
