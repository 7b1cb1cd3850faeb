//! Session orchestrator.
//!
//! One [`Orchestrator`] owns the process-wide session: the recording flag,
//! the conversation history and the last captured request. Every assist
//! operation takes the operation lock for its whole duration, including the
//! capture and model awaits, so operations never interleave and history is
//! appended in call order.
//!
//! # Operations
//!
//! | Command | Method | Rejected when |
//! |---------|--------|---------------|
//! | `startRecording` | [`Orchestrator::start_recording`] | unconfigured, already recording |
//! | `stopRecording` | [`Orchestrator::stop_recording`] | not recording |
//! | `screenshot` | [`Orchestrator::screenshot`] | unconfigured, recording |
//! | `followUp` | [`Orchestrator::follow_up`] | unconfigured, recording, blank text |
//! | `retry` | [`Orchestrator::retry`] | unconfigured, recording, nothing captured yet |
//! | `clearMemory` | [`Orchestrator::clear_memory`] | never |
//! | `levels` | [`Orchestrator::audio_levels`] | never (does not take the lock) |
//!
//! A failed operation emits exactly one `error` event to the calling
//! connection and returns the same error to the caller. Socket connections
//! feed commands through a [`CommandQueue`] so they run in receive order.
//!
//! # Auto-stop
//!
//! `start_recording` arms a timer for `max_recording`. When it fires the
//! recording is stopped and processed as if the active connection had sent
//! `stopRecording`. Each recording carries a generation number; a timer only
//! acts on the generation that armed it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{AudioArtifacts, AudioCapture, AudioLevels, ScreenCapture};
use crate::config::Config;
use crate::error::{AssistError, AssistResult};
use crate::history::{HistoryManager, HistoryTurn};
use crate::llm::{AnswerClient, Modality};
use crate::retrieval::{retrieve, Payload, RequestKind, RetrievalOutcome, RetrievalProvider};

/// History text recorded for the user side of an audio exchange.
pub const AUDIO_TURN: &str = "[Audio clip: microphone and system audio]";
/// History text recorded for the user side of a screenshot exchange.
pub const SCREENSHOT_TURN: &str = "[Screenshot of the current screen]";

/// Events pushed to a client connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    State {
        is_recording: bool,
        has_key: bool,
        stream_enabled: bool,
        stream_fps: u32,
    },
    #[serde(rename_all = "camelCase")]
    Recording { is_recording: bool },
    Status { message: String },
    Progress { percent: u8, message: String },
    Answer { text: String },
    Memory { count: usize },
    Levels { mic: f32, system: f32 },
    Error { message: String, retryable: bool },
}

impl ClientEvent {
    pub fn status(message: impl Into<String>) -> Self {
        ClientEvent::Status {
            message: message.into(),
        }
    }
}

/// Delivers events to connections. Returns `false` when the connection is
/// gone or its queue is closed.
pub trait EventSink: Send + Sync {
    fn emit(&self, connection: &str, event: ClientEvent) -> bool;
}

/// Commands a client can invoke.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    StartRecording,
    StopRecording,
    Screenshot,
    FollowUp {
        #[serde(default)]
        text: String,
    },
    Retry,
    ClearMemory,
    Levels,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub max_recording: Duration,
    pub min_audio_bytes: usize,
    pub max_history: usize,
    pub stream_enabled: bool,
    pub stream_fps: u32,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_recording: config.session.max_recording(),
            min_audio_bytes: config.session.min_audio_bytes,
            max_history: config.session.max_history,
            stream_enabled: config.stream.enabled,
            stream_fps: config.stream.effective_fps(),
        }
    }
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub retrieval: Arc<dyn RetrievalProvider>,
    pub answers: Arc<dyn AnswerClient>,
    pub audio: Arc<dyn AudioCapture>,
    pub screen: Arc<dyn ScreenCapture>,
    pub events: Arc<dyn EventSink>,
}

/// The most recent successful capture, kept for `retry`.
#[derive(Clone, Debug)]
enum LastRequest {
    Audio(Arc<AudioArtifacts>),
    Screenshot(Arc<Vec<u8>>),
}

struct SessionState {
    is_recording: bool,
    generation: u64,
    active_connection: Option<String>,
    last_request: Option<LastRequest>,
    history: HistoryManager,
    auto_stop: Option<CancellationToken>,
}

pub struct Orchestrator {
    settings: SessionSettings,
    collaborators: Collaborators,
    state: Mutex<SessionState>,
    // Readable without waiting behind a long-running operation.
    recording: AtomicBool,
    memory_count: AtomicUsize,
}

impl Orchestrator {
    pub fn new(settings: SessionSettings, collaborators: Collaborators) -> Arc<Self> {
        let history = HistoryManager::new(settings.max_history);
        Arc::new(Self {
            settings,
            collaborators,
            state: Mutex::new(SessionState {
                is_recording: false,
                generation: 0,
                active_connection: None,
                last_request: None,
                history,
                auto_stop: None,
            }),
            recording: AtomicBool::new(false),
            memory_count: AtomicUsize::new(0),
        })
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn memory_count(&self) -> usize {
        self.memory_count.load(Ordering::Acquire)
    }

    /// Chronological copy of the conversation. Waits for any running
    /// operation to finish.
    pub async fn history(&self) -> Vec<HistoryTurn> {
        self.state.lock().await.history.snapshot()
    }

    /// Greet a new connection with the current state.
    pub fn on_connect(&self, connection: &str) {
        let has_key = self.collaborators.answers.is_configured();
        self.emit(
            connection,
            ClientEvent::State {
                is_recording: self.is_recording(),
                has_key,
                stream_enabled: self.settings.stream_enabled,
                stream_fps: self.settings.stream_fps,
            },
        );
        self.emit(
            connection,
            ClientEvent::Memory {
                count: self.memory_count(),
            },
        );
        if !has_key {
            self.emit(
                connection,
                ClientEvent::Error {
                    message: unconfigured().to_string(),
                    retryable: false,
                },
            );
        }
    }

    /// Run a client command. Failures are already reported to `connection`.
    pub async fn dispatch(self: &Arc<Self>, connection: &str, command: Command) {
        debug!(connection, ?command, "dispatching command");
        let _ = match command {
            Command::StartRecording => self.start_recording(connection).await,
            Command::StopRecording => self.stop_recording(connection).await,
            Command::Screenshot => self.screenshot(connection).await,
            Command::FollowUp { text } => self.follow_up(connection, &text).await,
            Command::Retry => self.retry(connection).await,
            Command::ClearMemory => self.clear_memory(connection).await,
            Command::Levels => self.audio_levels(connection).await.map(|_| ()),
        };
    }

    pub async fn start_recording(self: &Arc<Self>, connection: &str) -> AssistResult<()> {
        let mut state = self.state.lock().await;
        let result = self.start_locked(&mut state, connection).await;
        // `retry` never replays a recording that failed to start.
        self.report(connection, result, false)
    }

    pub async fn stop_recording(&self, connection: &str) -> AssistResult<()> {
        let mut state = self.state.lock().await;
        let result = self.stop_locked(&mut state, connection).await;
        self.finish(&state, connection, result)
    }

    pub async fn screenshot(&self, connection: &str) -> AssistResult<()> {
        let mut state = self.state.lock().await;
        let result = self.screenshot_locked(&mut state, connection).await;
        self.finish(&state, connection, result)
    }

    pub async fn follow_up(&self, connection: &str, text: &str) -> AssistResult<()> {
        let mut state = self.state.lock().await;
        let result = self.follow_up_locked(&mut state, connection, text).await;
        self.finish(&state, connection, result)
    }

    pub async fn retry(&self, connection: &str) -> AssistResult<()> {
        let mut state = self.state.lock().await;
        let result = self.retry_locked(&mut state, connection).await;
        self.finish(&state, connection, result)
    }

    pub async fn clear_memory(&self, connection: &str) -> AssistResult<()> {
        let mut state = self.state.lock().await;
        state.history.clear();
        self.memory_count.store(0, Ordering::Release);
        info!("conversation memory cleared");
        self.emit(connection, ClientEvent::Memory { count: 0 });
        self.emit(connection, ClientEvent::status("Memory cleared."));
        Ok(())
    }

    /// Current capture levels. Does not wait for a running operation.
    pub async fn audio_levels(&self, connection: &str) -> AssistResult<AudioLevels> {
        match self.collaborators.audio.probe().await {
            Ok(levels) => {
                self.emit(
                    connection,
                    ClientEvent::Levels {
                        mic: levels.mic,
                        system: levels.system,
                    },
                );
                Ok(levels)
            }
            Err(e) => {
                debug!(error = %e, "level probe failed");
                self.emit(
                    connection,
                    ClientEvent::Error {
                        message: e.to_string(),
                        retryable: false,
                    },
                );
                Err(e)
            }
        }
    }

    /// Timer path: stop the recording armed as `generation`, reporting to
    /// whichever connection started it.
    pub async fn auto_stop(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if !state.is_recording || state.generation != generation {
            debug!(generation, "stale auto-stop ignored");
            return;
        }

        let connection = state.active_connection.clone().unwrap_or_default();
        info!(generation, connection = %connection, "maximum recording time reached");
        let result = self.stop_locked(&mut state, &connection).await;
        let _ = self.finish(&state, &connection, result);
    }

    /// Disarm the timer and release the capture device.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.auto_stop.take() {
            timer.cancel();
        }
        if state.is_recording {
            state.is_recording = false;
            self.recording.store(false, Ordering::Release);
            if let Err(e) = self.collaborators.audio.stop().await {
                warn!(error = %e, "failed to stop recording during shutdown");
            }
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        state: &mut SessionState,
        connection: &str,
    ) -> AssistResult<()> {
        if !self.collaborators.answers.is_configured() {
            return Err(unconfigured());
        }
        if state.is_recording {
            return Err(AssistError::StateConflict("Already recording.".into()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        self.collaborators.audio.start(&session_id).await?;

        state.generation += 1;
        state.is_recording = true;
        state.active_connection = Some(connection.to_string());
        self.recording.store(true, Ordering::Release);

        let timer = CancellationToken::new();
        state.auto_stop = Some(timer.clone());
        let generation = state.generation;
        let limit = self.settings.max_recording;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(limit) => this.auto_stop(generation).await,
            }
        });

        info!(session_id = %session_id, generation, connection, "recording started");
        self.emit(connection, ClientEvent::Recording { is_recording: true });
        Ok(())
    }

    async fn stop_locked(&self, state: &mut SessionState, connection: &str) -> AssistResult<()> {
        if !state.is_recording {
            return Err(AssistError::StateConflict("Not recording.".into()));
        }

        if let Some(timer) = state.auto_stop.take() {
            timer.cancel();
        }
        state.is_recording = false;
        self.recording.store(false, Ordering::Release);
        self.emit(connection, ClientEvent::Recording { is_recording: false });

        let artifacts = Arc::new(self.collaborators.audio.stop().await?);
        info!(
            mic_bytes = artifacts.mic.len(),
            system_bytes = artifacts.system.len(),
            "recording stopped"
        );
        state.last_request = Some(LastRequest::Audio(Arc::clone(&artifacts)));

        self.process_audio(state, connection, &artifacts).await
    }

    async fn screenshot_locked(
        &self,
        state: &mut SessionState,
        connection: &str,
    ) -> AssistResult<()> {
        if !self.collaborators.answers.is_configured() {
            return Err(unconfigured());
        }
        if state.is_recording {
            return Err(AssistError::StateConflict(
                "Cannot take a screenshot while recording.".into(),
            ));
        }

        let image = Arc::new(self.collaborators.screen.capture().await?);
        state.last_request = Some(LastRequest::Screenshot(Arc::clone(&image)));

        self.process_screenshot(state, connection, &image).await
    }

    async fn follow_up_locked(
        &self,
        state: &mut SessionState,
        connection: &str,
        text: &str,
    ) -> AssistResult<()> {
        if !self.collaborators.answers.is_configured() {
            return Err(unconfigured());
        }
        if state.is_recording {
            return Err(AssistError::StateConflict(
                "Cannot send a follow-up while recording.".into(),
            ));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(AssistError::InvalidInput(
                "Please enter follow-up text.".into(),
            ));
        }

        self.emit(connection, ClientEvent::status("Thinking..."));

        let max_chars = self.collaborators.retrieval.settings().query_max_chars;
        let query: String = text.chars().take(max_chars).collect();
        let payload = self.fetch_payload(RequestKind::FollowUp, &query).await;

        let history = state.history.snapshot();
        let answer = self
            .collaborators
            .answers
            .get_answer(
                Modality::Text { text },
                &history,
                payload.context(),
                payload.tools(),
            )
            .await?;

        state.history.push_exchange(text, answer.clone());
        self.emit_answer(state, connection, answer);
        Ok(())
    }

    async fn retry_locked(&self, state: &mut SessionState, connection: &str) -> AssistResult<()> {
        if !self.collaborators.answers.is_configured() {
            return Err(unconfigured());
        }
        if state.is_recording {
            return Err(AssistError::StateConflict(
                "Cannot retry while recording.".into(),
            ));
        }

        match state.last_request.clone() {
            None => Err(AssistError::StateConflict("Nothing to retry".into())),
            Some(LastRequest::Audio(artifacts)) => {
                info!("retrying last audio request");
                self.process_audio(state, connection, &artifacts).await
            }
            Some(LastRequest::Screenshot(image)) => {
                info!("retrying last screenshot request");
                self.process_screenshot(state, connection, &image).await
            }
        }
    }

    async fn process_audio(
        &self,
        state: &mut SessionState,
        connection: &str,
        artifacts: &AudioArtifacts,
    ) -> AssistResult<()> {
        self.emit(connection, ClientEvent::status("Processing audio..."));

        let mic_silent = artifacts.mic.len() < self.settings.min_audio_bytes;
        let system_silent = artifacts.system.len() < self.settings.min_audio_bytes;
        if mic_silent && system_silent {
            debug!("both audio tracks are below the silence threshold");
        }

        let query = self.history_query(state);
        let payload = self.fetch_payload(RequestKind::Audio, &query).await;

        let history = state.history.snapshot();
        let answer = self
            .collaborators
            .answers
            .get_answer(
                Modality::Audio {
                    mic: &artifacts.mic,
                    system: &artifacts.system,
                    mic_silent,
                    system_silent,
                },
                &history,
                payload.context(),
                payload.tools(),
            )
            .await?;

        state.history.push_exchange(AUDIO_TURN, answer.clone());
        self.emit_answer(state, connection, answer);
        Ok(())
    }

    async fn process_screenshot(
        &self,
        state: &mut SessionState,
        connection: &str,
        image: &[u8],
    ) -> AssistResult<()> {
        let query = self.history_query(state);
        let payload = self.fetch_payload(RequestKind::Screenshot, &query).await;

        let history = state.history.snapshot();
        let answer = self
            .collaborators
            .answers
            .get_answer(
                Modality::Screenshot { image },
                &history,
                payload.context(),
                payload.tools(),
            )
            .await?;

        state.history.push_exchange(SCREENSHOT_TURN, answer.clone());
        self.emit_answer(state, connection, answer);
        Ok(())
    }

    /// Recent history as a retrieval query; empty when retrieval is off.
    fn history_query(&self, state: &SessionState) -> String {
        let settings = self.collaborators.retrieval.settings();
        if !settings.enabled {
            return String::new();
        }
        state.history.recent_query(settings.query_max_chars)
    }

    async fn fetch_payload(&self, kind: RequestKind, query: &str) -> Payload {
        match retrieve(self.collaborators.retrieval.as_ref(), kind, query).await {
            RetrievalOutcome::Found(payload) => payload,
            RetrievalOutcome::Empty => Payload::Empty,
            RetrievalOutcome::Failed(reason) => {
                warn!(?kind, %reason, "retrieval failed; answering without context");
                Payload::Empty
            }
        }
    }

    fn emit_answer(&self, state: &SessionState, connection: &str, answer: String) {
        let count = state.history.len();
        self.memory_count.store(count, Ordering::Release);
        self.emit(connection, ClientEvent::Answer { text: answer });
        self.emit(connection, ClientEvent::Memory { count });
    }

    /// Report a failed operation while the lock is still held.
    fn finish(
        &self,
        state: &SessionState,
        connection: &str,
        result: AssistResult<()>,
    ) -> AssistResult<()> {
        self.report(connection, result, state.last_request.is_some())
    }

    fn report(
        &self,
        connection: &str,
        result: AssistResult<()>,
        has_last_request: bool,
    ) -> AssistResult<()> {
        if let Err(e) = &result {
            let retryable = e.is_retryable(has_last_request);
            warn!(kind = e.kind(), error = %e, retryable, connection, "assist operation failed");
            self.emit(
                connection,
                ClientEvent::Error {
                    message: e.to_string(),
                    retryable,
                },
            );
        }
        result
    }

    fn emit(&self, connection: &str, event: ClientEvent) {
        if !self.collaborators.events.emit(connection, event) {
            warn!(connection, "event not delivered; connection is gone");
        }
    }
}

fn unconfigured() -> AssistError {
    AssistError::Configuration("Model API key is not configured.".into())
}

/// Per-connection command queue.
///
/// Assist commands run one at a time on a worker task in the order they were
/// submitted. `levels` is answered inline so it never waits behind a running
/// operation.
pub struct CommandQueue {
    orchestrator: Arc<Orchestrator>,
    connection: String,
    sender: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    pub fn spawn(orchestrator: Arc<Orchestrator>, connection: &str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();
        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            let connection = connection.to_string();
            tokio::spawn(async move {
                while let Some(command) = receiver.recv().await {
                    orchestrator.dispatch(&connection, command).await;
                }
                debug!(connection = %connection, "command queue drained");
            })
        };
        Self {
            orchestrator,
            connection: connection.to_string(),
            sender,
            worker,
        }
    }

    pub async fn submit(&self, command: Command) {
        if command == Command::Levels {
            self.orchestrator.dispatch(&self.connection, command).await;
            return;
        }
        if self.sender.send(command).is_err() {
            warn!(connection = %self.connection, "command queue closed; command dropped");
        }
    }

    /// Stop accepting commands and wait for the queued ones to finish.
    pub async fn close(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            warn!(connection = %self.connection, error = %e, "command worker failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_camel_case() {
        let state = serde_json::to_value(ClientEvent::State {
            is_recording: true,
            has_key: false,
            stream_enabled: true,
            stream_fps: 2,
        })
        .unwrap();
        assert_eq!(
            state,
            json!({ "type": "state", "isRecording": true, "hasKey": false, "streamEnabled": true, "streamFps": 2 })
        );

        let err = serde_json::to_value(ClientEvent::Error {
            message: "Nothing to retry".into(),
            retryable: false,
        })
        .unwrap();
        assert_eq!(
            err,
            json!({ "type": "error", "message": "Nothing to retry", "retryable": false })
        );
    }

    #[test]
    fn commands_deserialize() {
        let cmd: Command = serde_json::from_str(r#"{"command":"startRecording"}"#).unwrap();
        assert_eq!(cmd, Command::StartRecording);
        let cmd: Command =
            serde_json::from_str(r#"{"command":"followUp","text":"why?"}"#).unwrap();
        assert_eq!(cmd, Command::FollowUp { text: "why?".into() });
        let cmd: Command = serde_json::from_str(r#"{"command":"followUp"}"#).unwrap();
        assert_eq!(cmd, Command::FollowUp { text: String::new() });
        assert!(serde_json::from_str::<Command>(r#"{"command":"reboot"}"#).is_err());
    }
}
