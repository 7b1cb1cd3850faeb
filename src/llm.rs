//! Model collaborator.
//!
//! The orchestrator asks an [`AnswerClient`] for one answer per assist
//! operation, passing the request [`Modality`], the conversation so far and
//! whatever retrieval produced. [`OpenAiAnswerClient`] implements it on top
//! of an OpenAI-compatible `POST {base_url}/chat/completions` endpoint:
//!
//! - text goes in as a plain `text` part;
//! - screenshots as an `image_url` part carrying a base64 data URL;
//! - audio as `input_audio` parts (`wav`), skipping tracks flagged silent;
//! - inline context is appended to the system message;
//! - a tools payload is forwarded verbatim in `tools`.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{AssistError, AssistResult};
use crate::history::{HistoryTurn, Role};

/// What the user is asking about.
#[derive(Clone, Copy, Debug)]
pub enum Modality<'a> {
    Audio {
        mic: &'a [u8],
        system: &'a [u8],
        mic_silent: bool,
        system_silent: bool,
    },
    Screenshot {
        image: &'a [u8],
    },
    Text {
        text: &'a str,
    },
}

impl Modality<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Modality::Audio { .. } => "audio",
            Modality::Screenshot { .. } => "screenshot",
            Modality::Text { .. } => "text",
        }
    }
}

#[async_trait]
pub trait AnswerClient: Send + Sync {
    /// False when credentials are missing; assist operations refuse to run.
    fn is_configured(&self) -> bool;

    async fn get_answer(
        &self,
        modality: Modality<'_>,
        history: &[HistoryTurn],
        rag_context: Option<&str>,
        rag_tools: Option<&Value>,
    ) -> AssistResult<String>;
}

pub struct OpenAiAnswerClient {
    config: LlmConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiAnswerClient {
    /// Reads the API key from `config.api_key_env`. A missing key is not an
    /// error here; the client simply reports itself unconfigured.
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            api_key,
            client,
        })
    }

    fn build_request(
        &self,
        modality: Modality<'_>,
        history: &[HistoryTurn],
        rag_context: Option<&str>,
        rag_tools: Option<&Value>,
    ) -> Value {
        build_chat_request(&self.config, modality, history, rag_context, rag_tools)
    }
}

#[async_trait]
impl AnswerClient for OpenAiAnswerClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn get_answer(
        &self,
        modality: Modality<'_>,
        history: &[HistoryTurn],
        rag_context: Option<&str>,
        rag_tools: Option<&Value>,
    ) -> AssistResult<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            AssistError::Configuration(format!("{} is not set", self.config.api_key_env))
        })?;

        let body = self.build_request(modality, history, rag_context, rag_tools);
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(modality = modality.name(), turns = history.len(), "requesting answer");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AssistError::Timeout(e.to_string())
                } else {
                    AssistError::Upstream(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AssistError::Upstream(format!("{}: {}", status, text)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| AssistError::Upstream(e.to_string()))?;
        parse_answer(&json)
    }
}

/// Assemble a chat-completions body.
pub fn build_chat_request(
    config: &LlmConfig,
    modality: Modality<'_>,
    history: &[HistoryTurn],
    rag_context: Option<&str>,
    rag_tools: Option<&Value>,
) -> Value {
    let mut system = config.system_prompt.clone();
    if let Some(context) = rag_context {
        system.push_str("\n\nReference material:\n");
        system.push_str(context);
    }

    let mut messages = vec![json!({ "role": "system", "content": system })];
    for turn in history {
        let role = match turn.role {
            Role::User => "user",
            Role::Model => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.text }));
    }
    messages.push(json!({ "role": "user", "content": user_content(config, modality) }));

    let mut body = json!({
        "model": config.model,
        "messages": messages,
    });
    if let Some(tools) = rag_tools {
        body["tools"] = json!([tools]);
    }
    body
}

fn user_content(config: &LlmConfig, modality: Modality<'_>) -> Value {
    let b64 = base64::engine::general_purpose::STANDARD;
    match modality {
        Modality::Text { text } => json!([{ "type": "text", "text": text }]),
        Modality::Screenshot { image } => json!([
            { "type": "text", "text": config.screenshot_prompt },
            {
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", sniff_image_type(image), b64.encode(image)) }
            }
        ]),
        Modality::Audio {
            mic,
            system,
            mic_silent,
            system_silent,
        } => {
            let mut parts = vec![json!({ "type": "text", "text": config.audio_prompt })];
            for (bytes, silent, label) in [(mic, mic_silent, "microphone"), (system, system_silent, "system audio")] {
                if silent {
                    parts.push(json!({ "type": "text", "text": format!("({} was silent)", label) }));
                } else {
                    parts.push(json!({
                        "type": "input_audio",
                        "input_audio": { "data": b64.encode(bytes), "format": "wav" }
                    }));
                }
            }
            Value::Array(parts)
        }
    }
}

fn sniff_image_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP") {
        "image/webp"
    } else {
        "image/png"
    }
}

fn parse_answer(json: &Value) -> AssistResult<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AssistError::Upstream("response contained no answer text".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_includes_history_and_context() {
        let config = LlmConfig::default();
        let history = vec![
            HistoryTurn::new(Role::User, "hi"),
            HistoryTurn::new(Role::Model, "hello"),
        ];
        let body = build_chat_request(
            &config,
            Modality::Text { text: "and then?" },
            &history,
            Some("Source: a.md (score 0.50)\nfacts"),
            None,
        );
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages[0]["content"].as_str().unwrap().contains("facts"));
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"][0]["text"], "and then?");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn silent_tracks_are_not_uploaded() {
        let config = LlmConfig::default();
        let body = build_chat_request(
            &config,
            Modality::Audio {
                mic: b"RIFFmic",
                system: b"",
                mic_silent: false,
                system_silent: true,
            },
            &[],
            None,
            Some(&json!({ "type": "file_search" })),
        );
        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], "input_audio");
        assert_eq!(parts[2]["type"], "text");
        assert_eq!(body["tools"][0]["type"], "file_search");
    }

    #[test]
    fn screenshot_uses_data_url() {
        let body = build_chat_request(
            &LlmConfig::default(),
            Modality::Screenshot {
                image: &[0xFF, 0xD8, 0xFF, 0x00],
            },
            &[],
            None,
            None,
        );
        let url = body["messages"][1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn parse_answer_requires_text() {
        let ok = json!({ "choices": [{ "message": { "content": " 42 " } }] });
        assert_eq!(parse_answer(&ok).unwrap(), "42");
        assert!(parse_answer(&json!({ "choices": [] })).is_err());
    }
}
