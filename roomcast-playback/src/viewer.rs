//! Viewer page driver
//!
//! Polls the backend for a room's stream info and feeds the live URL into a
//! playback engine once the stream becomes active.

use async_trait::async_trait;
use reqwest::Client;
use roomcast_core::events::{resolve_playback_url, StreamInfo};
use roomcast_core::{RoomId, ViewerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use url::Url;

use crate::engine::PlaybackControl;
use crate::error::{PlaybackError, PlaybackResult};

pub const INACTIVE_MESSAGE: &str = "This stream is not currently active.";
pub const UNREACHABLE_MESSAGE: &str = "Failed to connect to the stream. Please try again later.";

/// Where the viewer learns whether a room is live
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamInfoSource: Send + Sync {
    async fn fetch(&self, room_id: &RoomId) -> PlaybackResult<StreamInfo>;
}

/// `GET {backend}/streams/info/{roomId}`
pub struct StreamInfoClient {
    http: Client,
    backend: Url,
}

impl StreamInfoClient {
    pub fn new(backend: Url, timeout: Duration) -> PlaybackResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, backend })
    }

    pub fn from_config(config: &ViewerConfig) -> PlaybackResult<Self> {
        Self::new(Url::parse(&config.backend_url)?, config.request_timeout())
    }

    #[must_use]
    pub const fn backend(&self) -> &Url {
        &self.backend
    }

    fn info_url(&self, room_id: &RoomId) -> PlaybackResult<Url> {
        let mut url = self.backend.clone();
        url.path_segments_mut()
            .map_err(|()| PlaybackError::InvalidSource(format!("{} cannot be a base URL", self.backend)))?
            .pop_if_empty()
            .extend(["streams", "info", room_id.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl StreamInfoSource for StreamInfoClient {
    async fn fetch(&self, room_id: &RoomId) -> PlaybackResult<StreamInfo> {
        let url = self.info_url(room_id)?;
        let info = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<StreamInfo>()
            .await?;
        Ok(info)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ViewerStatus {
    #[default]
    Checking,
    Inactive,
    Unreachable,
    Active(Url),
}

impl ViewerStatus {
    /// Text shown in place of the player
    #[must_use]
    pub const fn message(&self) -> Option<&'static str> {
        match self {
            Self::Inactive => Some(INACTIVE_MESSAGE),
            Self::Unreachable => Some(UNREACHABLE_MESSAGE),
            Self::Checking | Self::Active(_) => None,
        }
    }

    #[must_use]
    pub const fn playback_url(&self) -> Option<&Url> {
        match self {
            Self::Active(url) => Some(url),
            _ => None,
        }
    }
}

pub struct StreamInfoPoller {
    source: Arc<dyn StreamInfoSource>,
    room_id: RoomId,
    /// Origin that relative playback URLs resolve against
    backend: Url,
    interval: Duration,
}

impl StreamInfoPoller {
    pub fn new(source: Arc<dyn StreamInfoSource>, room_id: RoomId, backend: Url, interval: Duration) -> Self {
        Self {
            source,
            room_id,
            backend,
            interval,
        }
    }

    /// Poller backed by the HTTP client described by `config`
    pub fn from_config(config: &ViewerConfig, room_id: RoomId) -> PlaybackResult<Self> {
        if config.poll_interval_ms == 0 {
            return Err(PlaybackError::Config("poll_interval_ms must be greater than 0".to_string()));
        }
        let client = StreamInfoClient::from_config(config)?;
        let backend = client.backend().clone();
        Ok(Self::new(Arc::new(client), room_id, backend, config.poll_interval()))
    }

    pub async fn poll_once(&self) -> ViewerStatus {
        let info = match self.source.fetch(&self.room_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(room_id = %self.room_id, "Stream info request failed: {e}");
                return ViewerStatus::Unreachable;
            }
        };

        match (info.is_active, info.playback_url) {
            (true, Some(path)) => match resolve_playback_url(&self.backend, &path) {
                Ok(url) => ViewerStatus::Active(url),
                Err(e) => {
                    warn!(room_id = %self.room_id, playback_url = %path, "Unusable playback URL: {e}");
                    ViewerStatus::Unreachable
                }
            },
            _ => ViewerStatus::Inactive,
        }
    }

    /// Poll immediately and then every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> (watch::Receiver<ViewerStatus>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(ViewerStatus::Checking);
        let span = tracing::info_span!("stream_info_poller", room_id = %self.room_id);

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let status = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        status = self.poll_once() => status,
                    };
                    tx.send_if_modified(|current| {
                        if *current == status {
                            return false;
                        }
                        debug!(from = ?current, to = ?status, "Viewer status changed");
                        *current = status;
                        true
                    });
                }
                debug!("Stream info poller stopped");
            }
            .instrument(span),
        );

        (rx, task)
    }
}

/// Polls stream info and hands each newly active URL to a playback engine.
/// Dropping the session stops polling.
pub struct ViewerSession {
    status: watch::Receiver<ViewerStatus>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ViewerSession {
    pub fn start(poller: StreamInfoPoller, playback: PlaybackControl) -> Self {
        let cancel = CancellationToken::new();
        let (status, poll_task) = poller.spawn(cancel.clone());
        let forward_task = tokio::spawn(forward_active_urls(status.clone(), playback, cancel.clone()));
        Self {
            status,
            cancel,
            tasks: vec![poll_task, forward_task],
        }
    }

    #[must_use]
    pub fn status(&self) -> ViewerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewerStatus> {
        self.status.clone()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Viewer task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward_active_urls(
    mut status: watch::Receiver<ViewerStatus>,
    playback: PlaybackControl,
    cancel: CancellationToken,
) {
    let mut current: Option<Url> = None;
    // The stream went inactive after `current` was handed over
    let mut lapsed = false;
    loop {
        let sent = match &*status.borrow_and_update() {
            ViewerStatus::Active(url) if current.as_ref() != Some(url) => {
                info!(src = %url, "Stream is live, starting playback");
                current = Some(url.clone());
                lapsed = false;
                playback.load(url.clone())
            }
            ViewerStatus::Active(url) if lapsed => {
                info!(src = %url, "Stream is live again, restarting playback");
                lapsed = false;
                playback.reset()
            }
            ViewerStatus::Inactive => {
                lapsed = current.is_some();
                Ok(())
            }
            _ => Ok(()),
        };
        if sent.is_err() {
            break;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = status.changed() => if changed.is_err() { break },
        }
    }
}
