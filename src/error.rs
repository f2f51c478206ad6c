use crate::audio::AudioError;
use crate::config::ConfigError;
use crate::deck::generator::GenerationError;
use crate::session::SessionState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Malformed audio fragment: {len} bytes leaves {trailing} trailing")]
    DecodeSkew { len: usize, trailing: usize },

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Session is {0:?}, expected Idle")]
    InvalidState(SessionState),

    #[error("Session start was cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        SessionError::DeviceUnavailable(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Channel(err.to_string())
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::Channel(format!("Invalid endpoint: {}", err))
    }
}

impl SessionError {
    /// Message suitable for showing to the user after a failed start.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::DeviceUnavailable(_) => {
                "audio device unavailable - check microphone and speaker permissions".to_string()
            }
            SessionError::Channel(_) => "could not reach the voice service".to_string(),
            SessionError::InvalidState(_) => "a voice session is already running".to_string(),
            SessionError::Config(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}
