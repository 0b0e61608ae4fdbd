use media::MediaError;
use shared_proto::events::{ErrorCode, SessionEvent};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("connection failed: {0}")]
    ConnectFailure(String),

    #[error("render failed: {0}")]
    RenderFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type VoiceResult<T> = Result<T, VoiceError>;

impl VoiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VoiceError::DeviceUnavailable(_) => ErrorCode::DeviceUnavailable,
            VoiceError::ConnectFailure(_) => ErrorCode::ConnectFailure,
            VoiceError::RenderFailure(_) => ErrorCode::RenderFailure,
            VoiceError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            VoiceError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }

    pub fn to_event(&self) -> SessionEvent {
        SessionEvent::Error {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<MediaError> for VoiceError {
    fn from(value: MediaError) -> Self {
        match value {
            MediaError::DeviceUnavailable(msg) => VoiceError::DeviceUnavailable(msg),
            MediaError::NotOpen(what) => VoiceError::DeviceUnavailable(format!("{what} is not open")),
            MediaError::RenderFailure(msg) => VoiceError::RenderFailure(msg),
            MediaError::MalformedFrame(msg) => VoiceError::ProtocolViolation(msg),
        }
    }
}

impl From<TransportError> for VoiceError {
    fn from(value: TransportError) -> Self {
        VoiceError::ConnectFailure(value.to_string())
    }
}
