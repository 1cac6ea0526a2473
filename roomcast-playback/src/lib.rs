//! Roomcast playback side
//!
//! Keeps a live HLS stream playing on a viewer despite transient network
//! and decoder failures. A single engine task owns the playback session,
//! classifies backend errors as fatal or recoverable, recovers in place when
//! it can and otherwise reloads with exponential backoff until the retry
//! budget is spent.
//!
//! ## Architecture
//!
//! - **`PlaybackEngine`**: the session actor; controlled through a `PlaybackHandle`
//! - **`PlaybackBackend`** / **`PlaybackRuntime`**: capability-selected render strategies
//! - **`RetryPolicy`**: reload backoff
//! - **`HealthMonitor`**: stall and stagnation detection
//! - **`ViewerSession`**: stream-info polling that starts playback once a room is live
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_playback::{PlaybackEngine, PlaybackSettings, StreamInfoPoller, ViewerSession};
//!
//! let engine = PlaybackEngine::spawn(runtime, PlaybackSettings::from_config(&config.playback)?);
//! let poller = StreamInfoPoller::from_config(&config.viewer, RoomId::from("r1"))?;
//! let viewer = ViewerSession::start(poller, engine.control());
//! let mut status = engine.subscribe();
//! ```

pub mod backend;
pub mod engine;
pub mod error;
pub mod health;
pub mod retry;
pub mod state;
pub mod viewer;

#[cfg(test)]
pub mod test_helpers;

pub use backend::{
    BackendError, BackendErrorType, BackendEvent, BackendKind, LowLatencyTuning, PlayError, PlaybackBackend,
    PlaybackRuntime,
};
pub use engine::{PlaybackControl, PlaybackEngine, PlaybackHandle, PlaybackSettings, PlaybackStatus};
pub use error::{PlaybackError, PlaybackResult};
pub use health::{HealthCounters, HealthMonitor};
pub use retry::RetryPolicy;
pub use state::{PlaybackEvent, PlaybackState};
pub use viewer::{StreamInfoClient, StreamInfoPoller, StreamInfoSource, ViewerSession, ViewerStatus};
