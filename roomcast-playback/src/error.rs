use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("{0}")]
    Unsupported(String),

    #[error("Invalid source URL: {0}")]
    InvalidSource(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Playback engine is no longer running")]
    EngineClosed,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;

impl From<url::ParseError> for PlaybackError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidSource(err.to_string())
    }
}

impl From<reqwest::Error> for PlaybackError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
