use std::time::Duration;

use thiserror::Error;

use crate::state::InvalidTransition;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Start failed: {0}")]
    StartFailed(String),

    #[error("Stop failed: {0}")]
    StopFailed(String),

    #[error("No supported encoding format: {0}")]
    UnsupportedFormat(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type BroadcastResult<T> = Result<T, BroadcastError>;

impl From<InvalidTransition> for BroadcastError {
    fn from(err: InvalidTransition) -> Self {
        Self::InvalidState(err.to_string())
    }
}

impl From<serde_json::Error> for BroadcastError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(format!("malformed payload: {err}"))
    }
}
