//! Playback session states and the transition table

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Loading,
    Playing,
    /// Playing but starved of data
    Stalled,
    /// Waiting out the backoff before reload `attempt`
    Retrying {
        attempt: u32,
        #[serde(rename = "delay_ms", serialize_with = "serialize_millis")]
        delay: Duration,
    },
    /// Retry budget spent; only a reset leaves this state
    Failed,
}

fn serialize_millis<S: serde::Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
}

impl PlaybackState {
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// States in which the backend is rendering
    #[must_use]
    pub const fn is_rendering(&self) -> bool {
        matches!(self, Self::Playing | Self::Stalled)
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Playing => "playing",
            Self::Stalled => "stalled",
            Self::Retrying { .. } => "retrying",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrying { attempt, delay } => write!(f, "retrying(#{attempt} in {}ms)", delay.as_millis()),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Manifest parsed or metadata loaded
    Playable,
    Stalled,
    Resumed,
    ReloadScheduled { attempt: u32, delay: Duration },
    ReloadStarted,
    RetriesExhausted,
    /// No backend can render the source
    Unsupported,
    /// Explicit reset or a new source
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{event:?} is not valid while {state}")]
pub struct InvalidPlaybackTransition {
    pub state: PlaybackState,
    pub event: PlaybackEvent,
}

pub fn transition(state: PlaybackState, event: PlaybackEvent) -> Result<PlaybackState, InvalidPlaybackTransition> {
    use PlaybackEvent as E;
    use PlaybackState as S;

    let next = match (state, event) {
        (_, E::Reset) => S::Loading,
        (S::Loading, E::Playable) => S::Playing,
        (S::Playing, E::Stalled) => S::Stalled,
        (S::Stalled, E::Resumed) => S::Playing,
        (S::Loading | S::Playing | S::Stalled, E::ReloadScheduled { attempt, delay }) => S::Retrying { attempt, delay },
        (S::Retrying { .. }, E::ReloadStarted) => S::Loading,
        (S::Loading | S::Playing | S::Stalled | S::Retrying { .. }, E::RetriesExhausted) => S::Failed,
        (S::Loading, E::Unsupported) => S::Failed,
        _ => return Err(InvalidPlaybackTransition { state, event }),
    };
    Ok(next)
}
