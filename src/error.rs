//! Error types for the audio core.

/// Errors surfaced by narration, the output devices and the live session.
///
/// None of these is shown to the child; narration failures are logged and
/// dropped, live failures close the session.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// Microphone access was denied.
    #[error("Microphone permission denied: {0}")]
    Permission(String),

    /// Network or channel failure (HTTP fetch, websocket link).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing or malformed audio payload.
    #[error("Audio decode failed: {0}")]
    Decode(String),

    /// Audio hardware could not be opened or driven.
    #[error("Audio device error: {0}")]
    Device(String),

    /// `connect()` called while a session is already connecting or open.
    #[error("Live session is already active")]
    AlreadyActive,

    /// The operation was aborted by a concurrent `disconnect()`.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for AudioError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AudioError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<base64::DecodeError> for AudioError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AudioError>;
