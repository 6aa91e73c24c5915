//! Error types for the voice conversation core.

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice conversation core.
///
/// Only `PermissionDenied`, `SessionStartFailed`, and `ChatRequestFailed`
/// ever surface to the user. Capture restarts, cancellation races, and
/// synthesis failures are recovered internally.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("failed to start session: {0}")]
    SessionStartFailed(String),

    #[error("speech capture failed: {0}")]
    CaptureFailed(String),

    #[error("chat request failed: {0}")]
    ChatRequestFailed(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("audio playback error: {0}")]
    Playback(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The user-facing slice of the error taxonomy. Everything else is recovered
/// internally and at most logged.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserNotice {
    /// Microphone access denied; the session was never created.
    PermissionDenied,
    /// Remote session creation failed; no partial state was retained.
    SessionStartFailed(String),
    /// One chat exchange failed; the core is listening again.
    ChatRequestFailed(String),
}

impl std::fmt::Display for UserNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserNotice::PermissionDenied => {
                write!(f, "Microphone access is denied. Enable it to start a conversation.")
            }
            UserNotice::SessionStartFailed(reason) => {
                write!(f, "Could not start the conversation: {}", reason)
            }
            UserNotice::ChatRequestFailed(reason) => {
                write!(f, "The agent did not answer ({}). Still listening.", reason)
            }
        }
    }
}
