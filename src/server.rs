//! HTTP + WebSocket host.
//!
//! Binds the [`Orchestrator`] to clients. Commands arrive as JSON text
//! frames on `/ws` and events go back the same way; the latest streamed
//! frame is served over plain HTTP.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/ws` | WebSocket: `{"command": ...}` in, `{"type": ...}` out |
//! | `GET`  | `/frame` | Latest frame bytes, or `204 No Content` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! When `[server].token` is set, `/ws` and `/frame` require it as a
//! `?token=` query parameter or an `Authorization: Bearer` header.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unauthorized", "message": "missing or invalid token" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser overlay
//! served from anywhere can connect.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::capture::{screen_capture_from_config, AudioCapture, ScreenCapture, UnavailableAudioCapture};
use crate::config::Config;
use crate::llm::{AnswerClient, OpenAiAnswerClient};
use crate::progress::{BroadcastProgress, IndexEvent, IndexProgressReporter};
use crate::retrieval::{create_provider, ProviderKind, RetrievalProvider};
use crate::session::{
    ClientEvent, Collaborators, Command, CommandQueue, EventSink, Orchestrator, SessionSettings,
};
use crate::stream::{run_stream_loop, ConnectionCounter, FrameStore, StreamSettings};

/// Capacity of each progress broadcast channel.
const PROGRESS_CAPACITY: usize = 256;

/// Open connections and their outbound event queues.
#[derive(Default)]
pub struct ConnectionHub {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ClientEvent>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<ClientEvent>>> {
        match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a connection; returns its id and the queue to drain.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<ClientEvent>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders().insert(id.clone(), tx);
        (id, rx)
    }

    pub fn unregister(&self, connection: &str) {
        self.senders().remove(connection);
    }

    /// Send `event` to every open connection.
    pub fn broadcast(&self, event: ClientEvent) {
        self.senders()
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

impl EventSink for ConnectionHub {
    fn emit(&self, connection: &str, event: ClientEvent) -> bool {
        match self.senders().get(connection) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl ConnectionCounter for ConnectionHub {
    fn connection_count(&self) -> usize {
        self.senders().len()
    }
}

impl From<IndexEvent> for ClientEvent {
    fn from(event: IndexEvent) -> Self {
        match event {
            IndexEvent::Progress { percent, message } => ClientEvent::Progress { percent, message },
            IndexEvent::Status { message } => ClientEvent::Status { message },
        }
    }
}

/// The non-transport collaborators a server runs with.
pub struct Backends {
    pub retrieval: Arc<dyn RetrievalProvider>,
    pub answers: Arc<dyn AnswerClient>,
    pub audio: Arc<dyn AudioCapture>,
    pub screen: Arc<dyn ScreenCapture>,
}

impl Backends {
    /// Default backends for `config`: the configured retrieval provider,
    /// the OpenAI-compatible answer client, command screen capture, and no
    /// audio device.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let kind = ProviderKind::from_config(&config.retrieval)?;
        Ok(Self {
            retrieval: create_provider(kind, config),
            answers: Arc::new(OpenAiAnswerClient::new(&config.llm)?),
            audio: Arc::new(UnavailableAudioCapture),
            screen: screen_capture_from_config(&config.capture),
        })
    }
}

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<ConnectionHub>,
    pub frames: Arc<FrameStore>,
    pub retrieval: Arc<dyn RetrievalProvider>,
    pub screen: Arc<dyn ScreenCapture>,
    token: Option<Arc<str>>,
    frame_content_type: Arc<str>,
}

impl AppState {
    pub fn new(config: &Config, backends: Backends) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let orchestrator = Orchestrator::new(
            SessionSettings::from_config(config),
            Collaborators {
                retrieval: Arc::clone(&backends.retrieval),
                answers: backends.answers,
                audio: backends.audio,
                screen: Arc::clone(&backends.screen),
                events: hub.clone(),
            },
        );
        Self {
            orchestrator,
            hub,
            frames: Arc::new(FrameStore::new()),
            retrieval: backends.retrieval,
            screen: backends.screen,
            token: config.server.token.as_deref().map(Arc::from),
            frame_content_type: Arc::from(config.server.frame_content_type.as_str()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(handle_ws))
        .route("/frame", get(handle_frame))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the server with the default backends for `config`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_backends(config, Backends::from_config(config)?).await
}

/// Starts the server with caller-supplied backends, e.g. a real audio
/// capture device. Runs until Ctrl-C.
pub async fn run_server_with_backends(config: &Config, backends: Backends) -> anyhow::Result<()> {
    let state = AppState::new(config, backends);
    let cancel = CancellationToken::new();

    let progress = Arc::new(BroadcastProgress::new(PROGRESS_CAPACITY));
    spawn_forwarder(progress.subscribe_progress(), state.hub.clone(), cancel.clone());
    spawn_forwarder(progress.subscribe_status(), state.hub.clone(), cancel.clone());
    spawn_index_build(state.retrieval.clone(), progress, cancel.clone());

    let stream = tokio::spawn(run_stream_loop(
        StreamSettings {
            enabled: config.stream.enabled,
            fps: config.stream.effective_fps(),
        },
        state.screen.clone(),
        state.frames.clone(),
        state.hub.clone(),
        cancel.clone(),
    ));

    let orchestrator = state.orchestrator.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, auth = config.server.token.is_some(), "assist server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    orchestrator.shutdown().await;
    if let Err(e) = stream.await {
        warn!(error = %e, "stream loop ended abnormally");
    }
    Ok(())
}

/// Build the retrieval index in the background. Failures are reported as
/// status events and leave the provider not ready.
fn spawn_index_build(
    retrieval: Arc<dyn RetrievalProvider>,
    progress: Arc<BroadcastProgress>,
    cancel: CancellationToken,
) {
    if retrieval.kind() == ProviderKind::Disabled {
        return;
    }
    tokio::spawn(async move {
        match retrieval.initialize(progress.as_ref(), &cancel).await {
            Ok(summary) => info!(
                provider = retrieval.kind().as_str(),
                files = summary.files,
                chunks = summary.chunks,
                "retrieval ready"
            ),
            Err(e) => {
                warn!(provider = retrieval.kind().as_str(), error = %e, "retrieval initialization failed");
                progress.report(IndexEvent::Status {
                    message: format!("Retrieval unavailable: {}", e),
                });
            }
        }
    });
}

fn spawn_forwarder(
    mut events: broadcast::Receiver<IndexEvent>,
    hub: Arc<ConnectionHub>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => hub.broadcast(event.into()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

// ============ Auth ============

#[derive(Deserialize, Default)]
struct AuthQuery {
    token: Option<String>,
}

fn authorize(state: &AppState, query: &AuthQuery, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(());
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let supplied = query.token.as_deref().or(bearer);

    match supplied {
        Some(token) if token == expected => Ok(()),
        _ => Err(unauthorized("missing or invalid token")),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /frame ============

async fn handle_frame(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &query, &headers)?;

    let Some(frame) = state.frames.latest().await else {
        return Ok((
            StatusCode::NO_CONTENT,
            [(header::CACHE_CONTROL, "no-store".to_string())],
        )
            .into_response());
    };

    Ok((
        [
            (header::CONTENT_TYPE, state.frame_content_type.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        [("x-frame-id", frame.id.to_string())],
        frame.bytes.as_ref().clone(),
    )
        .into_response())
}

// ============ GET /ws ============

async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    authorize(&state, &query, &headers)?;
    Ok(ws.on_upgrade(move |socket| serve_socket(state, socket)))
}

async fn serve_socket(state: AppState, socket: WebSocket) {
    let (connection, mut outbound) = state.hub.register();
    info!(connection = %connection, "client connected");
    state.orchestrator.on_connect(&connection);

    let commands = CommandQueue::spawn(state.orchestrator.clone(), &connection);
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Command>(text.as_str()) {
                Ok(command) => commands.submit(command).await,
                Err(e) => {
                    debug!(connection = %connection, error = %e, "unparseable command");
                    state.hub.emit(
                        &connection,
                        ClientEvent::Error {
                            message: format!("Invalid command: {}", e),
                            retryable: false,
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %connection, error = %e, "socket error");
                break;
            }
        }
    }

    state.hub.unregister(&connection);
    writer.abort();
    commands.close().await;
    info!(connection = %connection, "client disconnected");
}
