//! Failure taxonomy for assist operations.
//!
//! Every failure that reaches a client is one [`AssistError`]. The variant
//! decides whether retrying can help: configuration problems, state
//! conflicts and bad input never do. Anything else does as long as there is
//! a stored capture to replay.

use thiserror::Error;

pub type AssistResult<T> = Result<T, AssistError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssistError {
    /// Missing credentials or an unconfigured collaborator.
    #[error("{0}")]
    Configuration(String),

    /// The operation is not valid in the current session state.
    #[error("{0}")]
    StateConflict(String),

    /// The client sent an unusable request, e.g. blank follow-up text.
    #[error("{0}")]
    InvalidInput(String),

    /// Audio or screen capture failed.
    #[error("Capture failed: {0}")]
    Capture(String),

    /// Index build or query failed.
    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    /// The model request failed.
    #[error("Model request failed: {0}")]
    Upstream(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl AssistError {
    /// Whether a client should be offered a retry, given whether a previous
    /// capture is stored.
    pub fn is_retryable(&self, has_last_request: bool) -> bool {
        match self {
            Self::Configuration(_) | Self::StateConflict(_) | Self::InvalidInput(_) => false,
            _ => has_last_request,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::StateConflict(_) => "state_conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::Capture(_) => "capture",
            Self::Retrieval(_) => "retrieval",
            Self::Upstream(_) => "upstream",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_never_retryable() {
        let err = AssistError::StateConflict("Already recording.".into());
        assert!(!err.is_retryable(true));
        assert!(!AssistError::Configuration("no key".into()).is_retryable(true));
        assert!(!AssistError::InvalidInput("blank".into()).is_retryable(true));
    }

    #[test]
    fn upstream_needs_a_stored_request() {
        let err = AssistError::Upstream("503".into());
        assert!(!err.is_retryable(false));
        assert!(err.is_retryable(true));
    }

    #[test]
    fn conflict_message_is_verbatim() {
        let err = AssistError::StateConflict("Nothing to retry".into());
        assert_eq!(err.to_string(), "Nothing to retry");
    }
}
