use media::{CaptureConfig, PlaybackConfig, DEFAULT_SPEAKING_THRESHOLD};
use thiserror::Error;
use url::Url;

pub const DEFAULT_AGENT_URL: &str = "ws://localhost:8000/ws";
pub const AGENT_URL_ENV: &str = "VOICE_AGENT_URL";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid agent endpoint: {0}")]
    Endpoint(String),

    #[error("block size must be greater than 0")]
    ZeroBlockSize,

    #[error("speaking threshold must be within (0, 1), got {0}")]
    Threshold(String),

    #[error("queue bound must be greater than 0")]
    ZeroQueueBound,
}

/// Everything a session needs besides the per-call connect params.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Base WebSocket URL of the agent; query parameters are appended per call.
    pub endpoint: String,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub speaking_threshold: f32,
    /// Playback queue bound; `None` never drops agent audio.
    pub max_queued_blocks: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_AGENT_URL.to_string(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            speaking_threshold: DEFAULT_SPEAKING_THRESHOLD,
            max_queued_blocks: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.endpoint).map_err(|e| ConfigError::Endpoint(format!("{}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Endpoint(format!(
                "{} must use ws:// or wss://",
                self.endpoint
            )));
        }

        if self.capture.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }

        let t = self.speaking_threshold;
        if !(t > 0.0 && t < 1.0) {
            return Err(ConfigError::Threshold(t.to_string()));
        }

        if self.max_queued_blocks == Some(0) {
            return Err(ConfigError::ZeroQueueBound);
        }

        Ok(())
    }
}
