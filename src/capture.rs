//! Audio and screen capture collaborators.
//!
//! The orchestrator only talks to the [`AudioCapture`] and [`ScreenCapture`]
//! traits. Device-level capture lives outside this crate; embedders plug
//! their own implementations in through
//! [`Collaborators`](crate::session::Collaborators). What ships here:
//!
//! - [`CommandScreenCapture`]: runs a configured program whose stdout is
//!   one image (e.g. `grim -` or `screencapture -x -t png /dev/stdout`).
//! - [`UnavailableAudioCapture`] / [`UnavailableScreenCapture`]: fail every
//!   call with a [`AssistError::Capture`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::CaptureConfig;
use crate::error::{AssistError, AssistResult};

/// The two recordings produced by one capture session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioArtifacts {
    /// Microphone track (WAV bytes).
    pub mic: Vec<u8>,
    /// System/loopback track (WAV bytes).
    pub system: Vec<u8>,
}

/// Peak input levels in `0.0..=1.0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AudioLevels {
    pub mic: f32,
    pub system: f32,
}

#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Begin recording for `session_id`.
    async fn start(&self, session_id: &str) -> AssistResult<()>;

    /// Stop the current recording and hand back both tracks.
    async fn stop(&self) -> AssistResult<AudioArtifacts>;

    /// Current peak levels, recording or not.
    async fn probe(&self) -> AssistResult<AudioLevels>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Capture one image of the screen.
    async fn capture(&self) -> AssistResult<Vec<u8>>;
}

pub struct UnavailableAudioCapture;

#[async_trait]
impl AudioCapture for UnavailableAudioCapture {
    async fn start(&self, _session_id: &str) -> AssistResult<()> {
        Err(AssistError::Capture("no audio capture device configured".into()))
    }
    async fn stop(&self) -> AssistResult<AudioArtifacts> {
        Err(AssistError::Capture("no audio capture device configured".into()))
    }
    async fn probe(&self) -> AssistResult<AudioLevels> {
        Err(AssistError::Capture("no audio capture device configured".into()))
    }
}

pub struct UnavailableScreenCapture;

#[async_trait]
impl ScreenCapture for UnavailableScreenCapture {
    async fn capture(&self) -> AssistResult<Vec<u8>> {
        Err(AssistError::Capture("no screen capture configured".into()))
    }
}

/// Screen capture backed by an external program.
pub struct CommandScreenCapture {
    program: String,
    args: Vec<String>,
}

impl CommandScreenCapture {
    /// Returns `None` when `command` is empty.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ScreenCapture for CommandScreenCapture {
    async fn capture(&self) -> AssistResult<Vec<u8>> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AssistError::Capture(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AssistError::Capture(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(AssistError::Capture(format!(
                "{} produced no image data",
                self.program
            )));
        }

        debug!(bytes = output.stdout.len(), "captured screenshot");
        Ok(output.stdout)
    }
}

/// Screen capture chosen from `[capture]`.
pub fn screen_capture_from_config(config: &CaptureConfig) -> Arc<dyn ScreenCapture> {
    match CommandScreenCapture::new(&config.screenshot_command) {
        Some(capture) => Arc::new(capture),
        None => Arc::new(UnavailableScreenCapture),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_none() {
        assert!(CommandScreenCapture::new(&[]).is_none());
    }

    #[tokio::test]
    async fn unavailable_capture_errors() {
        let err = UnavailableScreenCapture.capture().await.unwrap_err();
        assert!(matches!(err, AssistError::Capture(_)));
        assert!(UnavailableAudioCapture.start("s").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_stdout_is_the_image() {
        let capture =
            CommandScreenCapture::new(&["printf".to_string(), "PNGDATA".to_string()]).unwrap();
        assert_eq!(capture.capture().await.unwrap(), b"PNGDATA".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_a_capture_error() {
        let capture = CommandScreenCapture::new(&["false".to_string()]).unwrap();
        assert!(matches!(
            capture.capture().await.unwrap_err(),
            AssistError::Capture(_)
        ));
    }
}
