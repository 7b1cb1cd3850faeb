//! # Assist Harness
//!
//! A retrieval-augmented assist server. Clients connect over WebSocket and
//! ask about what they just heard (microphone + system audio), what is on
//! screen, or a typed follow-up. Each question is answered by a model,
//! optionally with context pulled from a local document corpus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ commands  ┌──────────────┐   ┌─────────────┐
//! │  Client  │──────────▶│ Orchestrator │──▶│ Retrieval   │
//! │ (ws/http)│◀──────────│ (one mutex)  │   │ local/embed/│
//! └──────────┘  events   └──────┬───────┘   │ managed     │
//!      ▲                        │           └─────────────┘
//!      │ /frame                 ▼
//! ┌──────────┐           ┌──────────────┐
//! │ Stream   │           │ Capture, LLM │
//! │  loop    │           │ collaborators│
//! └──────────┘           └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! assist index                      # build the configured index once
//! assist query "rate limiting"      # show the context a question would get
//! assist serve                      # start the WebSocket server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Failure taxonomy and retryability |
//! | [`chunk`] | Text cleaning, chunking, tokenization |
//! | [`retrieval`] | Provider abstraction and backends |
//! | [`history`] | Bounded conversation log |
//! | [`progress`] | Index progress reporting |
//! | [`capture`] | Audio and screen capture collaborators |
//! | [`llm`] | Model collaborator |
//! | [`session`] | Session orchestrator |
//! | [`stream`] | Background frame publisher |
//! | [`server`] | HTTP + WebSocket host |
//! | [`index_cmd`] | `index` and `query` commands |

pub mod capture;
pub mod chunk;
pub mod config;
pub mod error;
pub mod history;
pub mod index_cmd;
pub mod llm;
pub mod progress;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod stream;
