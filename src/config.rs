use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Fixed input sample rate sent to the agent
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Fixed sample rate of synthesized speech from the agent
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured frame
pub const FRAME_LENGTH: usize = 4096;
/// Gain applied to captured audio before fan-out
pub const DEFAULT_INPUT_GAIN: f32 = 2.5;

const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
const DEFAULT_VOICE: &str = "Puck";

const PERSONA: &str = "You are a friendly presentation designer working with the user by voice. \
When the user describes a topic, call generate_presentation with a concise topic. \
When the user asks to change a slide, call update_slide with only the fields that change; \
omit slide_index to edit the slide currently on screen. \
Keep spoken replies short and conversational.";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Configuration for the realtime session channel
#[derive(Debug)]
pub struct SessionConfig {
    pub api_key: SecretBox<String>,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    /// How long to wait for the remote side to acknowledge setup
    pub setup_timeout: Duration,
}

impl SessionConfig {
    /// Load session configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let api_key = load_api_key("GEMINI_API_KEY")?;
        Ok(Self {
            api_key,
            endpoint: env::var("VOICE_DECK_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.into()),
            model: env::var("VOICE_DECK_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            voice: env::var("VOICE_DECK_VOICE").unwrap_or_else(|_| DEFAULT_VOICE.into()),
            instructions: PERSONA.to_string(),
            setup_timeout: Duration::from_secs(10),
        })
    }

    /// Build a config around an explicit key, with defaults for the rest
    pub fn with_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretBox::new(Box::new(api_key.into())),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: PERSONA.to_string(),
            setup_timeout: Duration::from_secs(10),
        }
    }

    /// Get the API key (use only when making API calls)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

fn load_api_key(env_var: &str) -> Result<SecretBox<String>, ConfigError> {
    let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;
    if key.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            name: env_var.to_string(),
            reason: "API key cannot be empty".to_string(),
        });
    }
    Ok(SecretBox::new(Box::new(key)))
}

/// Microphone capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Input device name (None = default device)
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub frame_length: usize,
    pub gain: f32,
    /// Frames buffered between the device callback and fan-out before the
    /// oldest is dropped
    pub queue_depth: usize,
    /// Number of frequency buckets exposed for level feedback
    pub analysis_bands: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: INPUT_SAMPLE_RATE,
            frame_length: FRAME_LENGTH,
            gain: DEFAULT_INPUT_GAIN,
            queue_depth: 8,
            analysis_bands: 5,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gain.is_finite() && self.gain > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "gain".to_string(),
                reason: format!("{} is not a positive multiplier", self.gain),
            });
        }
        if self.frame_length == 0 || self.queue_depth == 0 {
            return Err(ConfigError::InvalidValue {
                name: "frame_length/queue_depth".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Speaker output configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Output device name (None = default device)
    pub device_name: Option<String>,
    pub sample_rate: u32,
    /// Safety margin added ahead of "now" when scheduling
    pub min_lead: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: OUTPUT_SAMPLE_RATE,
            min_lead: Duration::from_millis(50),
        }
    }
}
