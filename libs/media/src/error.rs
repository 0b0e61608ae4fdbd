use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("render failed: {0}")]
    RenderFailure(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("{0} is not open")]
    NotOpen(&'static str),
}

pub type MediaResult<T> = Result<T, MediaError>;
