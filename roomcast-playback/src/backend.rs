//! Playback backend strategy
//!
//! A backend renders one live URL. Two strategies exist: a software
//! demux/decode pipeline (preferred, supports live-edge seeking and
//! low-latency tuning) and delegation to a native player. The engine picks
//! one through [`select_backend`] and then talks to it only through
//! [`PlaybackBackend`].

use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{PlaybackError, PlaybackResult};

pub const HLS_UNSUPPORTED_MESSAGE: &str = "HLS is not supported in this browser";

/// Query parameter carrying the cache-defeating token
pub const CACHE_BUST_PARAM: &str = "_t";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software demux/decode
    Demux,
    /// Native playback delegation
    Native,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Demux => "demux",
            Self::Native => "native",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorType {
    Network,
    Media,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub fatal: bool,
    pub kind: BackendErrorType,
    pub details: String,
}

impl BackendError {
    pub fn fatal(kind: BackendErrorType, details: impl Into<String>) -> Self {
        Self {
            fatal: true,
            kind,
            details: details.into(),
        }
    }

    pub fn recoverable(kind: BackendErrorType, details: impl Into<String>) -> Self {
        Self {
            fatal: false,
            kind,
            details: details.into(),
        }
    }
}

/// Notifications raised by a loaded backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Master playlist parsed; the stream is playable
    ManifestParsed { live: bool },
    /// A media playlist (re)loaded
    LevelLoaded { live: bool },
    BufferAppended,
    /// Native playback: enough metadata to start playing
    MetadataLoaded,
    /// Playback paused for lack of data
    Waiting,
    /// Periodic progress tick
    TimeUpdate { position: f64, paused: bool },
    Error(BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayError {
    /// Autoplay blocked until a user gesture
    #[error("playback not allowed: {0}")]
    NotAllowed(String),

    #[error("playback failed: {0}")]
    Other(String),
}

pub trait PlaybackBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Start loading `url`. Events arrive on the returned channel until
    /// [`dispose`](Self::dispose).
    fn load(&mut self, url: &Url) -> PlaybackResult<mpsc::UnboundedReceiver<BackendEvent>>;

    /// Restart fragment loading without a reload. Returns `false` when the
    /// backend has no such hook.
    fn resume_loading(&mut self) -> bool;

    /// Attempt in-place decoder recovery. Returns `false` when unavailable.
    fn recover_media_error(&mut self) -> bool;

    /// Jump close to the live edge of the current timeline
    fn seek_to_live_edge(&mut self);

    /// Ask the player to start. The returned future settles once the
    /// platform accepts or rejects the request and must not borrow the
    /// backend; the engine keeps serving commands while it is pending.
    fn play(&mut self, muted: bool) -> BoxFuture<'static, Result<(), PlayError>>;

    /// Release every resource held by the backend. Must tolerate repeated calls.
    fn dispose(&mut self);
}

/// Capability check and backend constructor for the current platform
pub trait PlaybackRuntime: Send + Sync {
    fn supports_demux(&self) -> bool;

    fn supports_native(&self) -> bool;

    fn create_demux(&self, tuning: &LowLatencyTuning) -> PlaybackResult<Box<dyn PlaybackBackend>>;

    fn create_native(&self) -> PlaybackResult<Box<dyn PlaybackBackend>>;
}

/// Demux backend tuning for live playback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowLatencyTuning {
    pub low_latency: bool,
    /// Target distance behind the live edge
    pub live_sync: Duration,
    /// Distance behind the live edge that forces a catch-up
    pub live_max_latency: Duration,
    pub max_buffer_length: Duration,
    pub max_buffer_size_bytes: u64,
    pub max_buffer_hole: Duration,
    pub fragment_load_timeout: Duration,
    pub manifest_load_timeout: Duration,
    pub max_load_retries: u32,
}

impl LowLatencyTuning {
    #[must_use]
    pub const fn for_mode(low_latency: bool) -> Self {
        const MB: u64 = 1024 * 1024;
        if low_latency {
            Self {
                low_latency,
                live_sync: Duration::from_secs(1),
                live_max_latency: Duration::from_secs(3),
                max_buffer_length: Duration::from_secs(4),
                max_buffer_size_bytes: 10 * MB,
                max_buffer_hole: Duration::from_millis(500),
                fragment_load_timeout: Duration::from_secs(20),
                manifest_load_timeout: Duration::from_secs(10),
                max_load_retries: 4,
            }
        } else {
            Self {
                low_latency,
                live_sync: Duration::from_secs(3),
                live_max_latency: Duration::from_secs(10),
                max_buffer_length: Duration::from_secs(10),
                max_buffer_size_bytes: 30 * MB,
                max_buffer_hole: Duration::from_millis(500),
                fragment_load_timeout: Duration::from_secs(20),
                manifest_load_timeout: Duration::from_secs(10),
                max_load_retries: 4,
            }
        }
    }
}

/// Create the preferred backend the runtime supports.
pub fn select_backend(
    runtime: &dyn PlaybackRuntime,
    tuning: &LowLatencyTuning,
) -> PlaybackResult<Box<dyn PlaybackBackend>> {
    if runtime.supports_demux() {
        runtime.create_demux(tuning)
    } else if runtime.supports_native() {
        runtime.create_native()
    } else {
        Err(PlaybackError::Unsupported(HLS_UNSUPPORTED_MESSAGE.to_string()))
    }
}

/// Append a cache-defeating token, keeping any existing query.
#[must_use]
pub fn cache_busted(src: &Url, token: i64) -> Url {
    let mut url = src.clone();
    url.query_pairs_mut()
        .append_pair(CACHE_BUST_PARAM, &token.to_string());
    url
}
