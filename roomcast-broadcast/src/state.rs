//! Broadcast lifecycle states and the transition table
//!
//! `transition` is the only place that decides which state follows which;
//! the controller feeds it events and stores the result.

use roomcast_core::QualityProfile;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    /// Waiting for the server to acknowledge the session start
    Starting,
    /// Encoder running, chunks flowing
    Active,
    /// Encoder being re-created at a new bitrate
    Restarting { target: QualityProfile },
    /// Capture torn down, waiting for the stop acknowledgment
    Stopping,
}

impl StreamState {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether a capture session may emit chunks in this state
    #[must_use]
    pub const fn is_emitting(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether a server-side session exists or is being created
    #[must_use]
    pub const fn has_session(&self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Restarting { .. })
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Restarting { .. } => "restarting",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restarting { target } => write!(f, "restarting({target})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    StartRequested,
    StartAcked,
    StartFailed,
    StopRequested,
    StopCompleted,
    QualityChangeRequested(QualityProfile),
    QualityChangeCompleted,
    /// The server reported the broadcast as ended
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{event:?} is not valid while {state}")]
pub struct InvalidTransition {
    pub state: StreamState,
    pub event: StreamEvent,
}

/// Compute the state that follows `state` when `event` happens.
pub fn transition(state: StreamState, event: StreamEvent) -> Result<StreamState, InvalidTransition> {
    use StreamEvent as E;
    use StreamState as S;

    let next = match (state, event) {
        (S::Idle, E::StartRequested) => S::Starting,
        (S::Starting, E::StartAcked) => S::Active,
        (S::Starting, E::StartFailed) => S::Idle,
        (S::Starting | S::Active | S::Restarting { .. }, E::StopRequested) => S::Stopping,
        (S::Stopping, E::StopCompleted) => S::Idle,
        (S::Active, E::QualityChangeRequested(target)) => S::Restarting { target },
        (S::Restarting { .. }, E::QualityChangeCompleted) => S::Active,
        (S::Active | S::Restarting { .. }, E::SessionEnded) => S::Idle,
        _ => return Err(InvalidTransition { state, event }),
    };
    Ok(next)
}
