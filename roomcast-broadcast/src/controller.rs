//! Broadcast controller
//!
//! Owns the one [`StreamSession`] of a participant and drives it through
//! [`StreamState`] against the server-side session lifecycle. Every state
//! change goes through [`transition`]; the controller only decides which
//! event to feed it and what side effects follow.
//!
//! Side effects are ordered so that chunks only flow while `Active`: the
//! capture session is bound after the start ack and torn down before the
//! stop request goes out.

use parking_lot::Mutex;
use roomcast_core::events::{self, StreamingStatus};
use roomcast_core::{BroadcastConfig, IngestTarget, QualityProfile, RoomId};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::capture::{
    CaptureSession, CaptureSettings, EncoderErrorHook, EncoderFactory, MediaSource, SharedStats, StatsSnapshot,
};
use crate::channel::{ChannelEvent, ChunkTransport, MessageChannel};
use crate::error::{BroadcastError, BroadcastResult};
use crate::lifecycle::SessionLifecycle;
use crate::state::{transition, StreamEvent, StreamState};

pub const RECORDING_ERROR_MESSAGE: &str = "Recording error occurred. Streaming may be interrupted.";
pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost. Streaming stopped.";
pub const STREAM_ENDED_MESSAGE: &str = "The stream has ended.";

/// Snapshot published on every state change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub state: StreamState,
    pub room_id: Option<RoomId>,
    pub quality: QualityProfile,
    pub playback_url: Option<Url>,
    pub viewer_url: Option<Url>,
    /// Latest human-readable notice, if any
    pub message: Option<String>,
    pub stats: StatsSnapshot,
}

/// Resolved controller settings
#[derive(Debug, Clone)]
struct ControllerSettings {
    public_origin: Url,
    start_ack_timeout: Duration,
    stop_ack_timeout: Duration,
    heartbeat_interval: Duration,
    quality_settle: Duration,
    capture: CaptureSettings,
}

impl ControllerSettings {
    fn from_config(config: &BroadcastConfig) -> BroadcastResult<Self> {
        let public_origin = Url::parse(&config.public_origin)
            .map_err(|e| BroadcastError::Config(format!("public_origin: {e}")))?;

        let timeslice = config.chunk_interval();
        let allowed = roomcast_core::config::MIN_CHUNK_INTERVAL_MS..=roomcast_core::config::MAX_CHUNK_INTERVAL_MS;
        if !allowed.contains(&config.chunk_interval_ms) {
            return Err(BroadcastError::Config(format!(
                "chunk_interval_ms must be within {}..={} ms",
                allowed.start(),
                allowed.end()
            )));
        }
        for (name, value) in [
            ("start_ack_timeout_ms", config.start_ack_timeout_ms),
            ("stop_ack_timeout_ms", config.stop_ack_timeout_ms),
            ("heartbeat_interval_ms", config.heartbeat_interval_ms),
            ("stats_window_ms", config.stats_window_ms),
        ] {
            if value == 0 {
                return Err(BroadcastError::Config(format!("{name} must be greater than 0")));
            }
        }

        Ok(Self {
            public_origin,
            start_ack_timeout: config.start_ack_timeout(),
            stop_ack_timeout: config.stop_ack_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            quality_settle: config.quality_settle(),
            capture: CaptureSettings {
                timeslice,
                audio_bitrate_bps: config.audio_bitrate_bps,
                stats_window: config.stats_window(),
            },
        })
    }
}

/// One producer-side broadcast attempt
struct StreamSession {
    id: Uuid,
    room_id: RoomId,
    target: IngestTarget,
    source: Arc<MediaSource>,
    /// Only set while `Active`
    playback_url: Option<Url>,
    stats: SharedStats,
    capture: Option<CaptureSession>,
    /// Cancels the pending start, the settle delay and the heartbeat
    cancel: CancellationToken,
}

impl StreamSession {
    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.playback_url = None;
    }
}

struct Inner {
    state: StreamState,
    quality: QualityProfile,
    session: Option<StreamSession>,
    message: Option<String>,
}

impl Inner {
    fn apply(&mut self, event: StreamEvent) -> BroadcastResult<StreamState> {
        let next = transition(self.state, event)?;
        debug!(from = %self.state, to = %next, ?event, "Stream state transition");
        self.state = next;
        Ok(next)
    }

    fn is_current(&self, session_id: Uuid) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session_id)
    }
}

/// What a stop teardown should report once the stop ack settles
enum StopCause {
    Requested,
    TransportLost,
    CaptureFailed(String),
}

pub struct StreamController {
    settings: ControllerSettings,
    transport: ChunkTransport,
    lifecycle: Arc<dyn SessionLifecycle>,
    encoders: Arc<dyn EncoderFactory>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ControllerStatus>,
    shutdown: CancellationToken,
}

impl StreamController {
    /// Build a controller and start listening to channel events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &BroadcastConfig,
        channel: Arc<dyn MessageChannel>,
        lifecycle: Arc<dyn SessionLifecycle>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> BroadcastResult<Arc<Self>> {
        let settings = ControllerSettings::from_config(config)?;
        let quality = config.default_quality;
        let (status_tx, _) = watch::channel(ControllerStatus {
            quality,
            ..ControllerStatus::default()
        });

        let events = channel.subscribe();
        let controller = Arc::new(Self {
            settings,
            transport: ChunkTransport::new(channel),
            lifecycle,
            encoders,
            inner: Mutex::new(Inner {
                state: StreamState::Idle,
                quality,
                session: None,
                message: None,
            }),
            status_tx,
            shutdown: CancellationToken::new(),
        });

        let span = tracing::info_span!("broadcast_channel_listener");
        tokio::spawn(
            Self::listen(Arc::downgrade(&controller), events, controller.shutdown.clone()).instrument(span),
        );

        Ok(controller)
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn quality(&self) -> QualityProfile {
        self.inner.lock().quality
    }

    #[must_use]
    pub fn playback_url(&self) -> Option<Url> {
        self.inner.lock().session.as_ref().and_then(|s| s.playback_url.clone())
    }

    /// Whether a capture session is currently bound
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.capture.as_ref().is_some_and(CaptureSession::is_running))
    }

    /// Current status with fresh send statistics
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        let inner = self.inner.lock();
        self.build_status(&inner)
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    /// Start broadcasting `source` into `room_id`.
    ///
    /// Resolves once the server acknowledged the session and the capture is
    /// bound, or once the start failed and the controller is back to idle.
    pub async fn start(
        self: &Arc<Self>,
        room_id: RoomId,
        source: Option<Arc<MediaSource>>,
        target: IngestTarget,
    ) -> BroadcastResult<()> {
        if room_id.is_empty() {
            return Err(BroadcastError::Precondition("room id is required".to_string()));
        }
        let source = match source {
            Some(source) if source.has_tracks() => source,
            Some(_) => return Err(BroadcastError::Precondition("media source has no tracks".to_string())),
            None => return Err(BroadcastError::Precondition("no media source available".to_string())),
        };
        if let IngestTarget::Rtmp { stream_key } = &target {
            if stream_key.trim().is_empty() {
                return Err(BroadcastError::Precondition("stream key is required".to_string()));
            }
        }
        if !self.transport.is_connected() {
            return Err(BroadcastError::Precondition("signaling channel is not connected".to_string()));
        }

        let (session_id, cancel) = {
            let mut inner = self.inner.lock();
            inner.apply(StreamEvent::StartRequested)?;
            let session = StreamSession {
                id: Uuid::new_v4(),
                room_id: room_id.clone(),
                target: target.clone(),
                source,
                playback_url: None,
                stats: SharedStats::default(),
                capture: None,
                cancel: CancellationToken::new(),
            };
            let handles = (session.id, session.cancel.clone());
            inner.session = Some(session);
            inner.message = Some("Starting stream...".to_string());
            self.publish(&inner);
            handles
        };

        let span = tracing::info_span!("broadcast_start", room_id = %room_id, session_id = %session_id, target = target.label());
        async {
            info!("Requesting session start");
            let timeout = self.settings.start_ack_timeout;
            let ack = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Start abandoned");
                    return Err(BroadcastError::StartFailed("start cancelled".to_string()));
                }
                ack = tokio::time::timeout(timeout, self.lifecycle.start_session(&room_id, &target)) => ack,
            };

            let ack = match ack {
                Ok(Ok(ack)) => ack,
                Ok(Err(e)) => {
                    let reason = match e {
                        BroadcastError::StartFailed(reason) => reason,
                        other => other.to_string(),
                    };
                    return Err(self.fail_start(session_id, reason));
                }
                Err(_) => return Err(self.fail_start(session_id, BroadcastError::Timeout(timeout).to_string())),
            };

            self.bind_capture(session_id, ack.playback_url.as_deref())
        }
        .instrument(span)
        .await
    }

    /// Tear down the capture and end the server-side session.
    ///
    /// Always ends in `Idle`. A no-op when nothing is running or a stop is
    /// already in flight. A failed or missing stop ack is returned as
    /// `StopFailed` after the controller is idle.
    pub async fn stop(&self) -> BroadcastResult<()> {
        self.stop_with(StopCause::Requested).await
    }

    /// Switch the encoder bitrate profile.
    ///
    /// Only acts while `Active` and for a different profile; otherwise a
    /// no-op. The encoder is re-created, never retuned in place.
    pub async fn change_quality(self: &Arc<Self>, profile: QualityProfile) -> BroadcastResult<()> {
        let (session_id, cancel, previous) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_emitting() {
                debug!(state = %inner.state, %profile, "Ignoring quality change while not active");
                return Ok(());
            }
            if inner.quality == profile {
                return Ok(());
            }
            let previous = inner.quality;
            inner.apply(StreamEvent::QualityChangeRequested(profile))?;
            let Some(session) = inner.session.as_mut() else {
                return Err(BroadcastError::InvalidState("active without a session".to_string()));
            };
            if let Some(mut capture) = session.capture.take() {
                capture.stop();
            }
            let handles = (session.id, session.cancel.clone(), previous);
            inner.message = Some(format!("Switching quality to {profile}..."));
            self.publish(&inner);
            handles
        };

        info!(session_id = %session_id, from = %previous, to = %profile, "Restarting encoder for quality change");

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(BroadcastError::InvalidState("quality change interrupted".to_string()));
            }
            () = tokio::time::sleep(self.settings.quality_settle) => {}
        }

        let failure = {
            let mut inner = self.inner.lock();
            if !inner.is_current(session_id) || !matches!(inner.state, StreamState::Restarting { .. }) {
                return Err(BroadcastError::InvalidState("quality change interrupted".to_string()));
            }

            match self.start_capture(&inner, profile) {
                Ok(capture) => {
                    if let Some(session) = inner.session.as_mut() {
                        session.capture = Some(capture);
                    }
                    inner.quality = profile;
                    inner.apply(StreamEvent::QualityChangeCompleted)?;
                    inner.message = None;
                    self.publish(&inner);
                    return Ok(());
                }
                Err(e) => {
                    warn!(session_id = %session_id, "Encoder re-creation at {profile} failed: {e}");
                    match self.start_capture(&inner, previous) {
                        Ok(capture) => {
                            if let Some(session) = inner.session.as_mut() {
                                session.capture = Some(capture);
                            }
                            inner.apply(StreamEvent::QualityChangeCompleted)?;
                            inner.message = Some(format!("Failed to change quality: {e}"));
                            self.publish(&inner);
                            return Err(e);
                        }
                        Err(fallback) => {
                            error!(session_id = %session_id, "Encoder could not be restored: {fallback}");
                            e
                        }
                    }
                }
            }
        };

        // No capture could be bound; an active session without one is not allowed
        let _ = self.stop_with(StopCause::CaptureFailed(failure.to_string())).await;
        Err(failure)
    }

    /// React to a `stream:status` push from the server.
    pub fn apply_status(&self, status: StreamingStatus) {
        let mut inner = self.inner.lock();
        if !status.streaming {
            if !matches!(inner.state, StreamState::Active | StreamState::Restarting { .. }) {
                return;
            }
            if inner.apply(StreamEvent::SessionEnded).is_err() {
                return;
            }
            if let Some(mut session) = inner.session.take() {
                info!(room_id = %session.room_id, session_id = %session.id, "Server ended the broadcast");
                session.teardown();
            }
            inner.message = Some(STREAM_ENDED_MESSAGE.to_string());
            self.publish(&inner);
            return;
        }

        if !inner.state.is_emitting() {
            return;
        }
        let Some(raw) = status.playback_url.as_deref() else {
            return;
        };
        let resolved = match events::resolve_playback_url(&self.settings.public_origin, raw) {
            Ok(url) => url,
            Err(e) => {
                warn!(playback_url = raw, "Ignoring unparsable playback URL: {e}");
                return;
            }
        };
        if let Some(session) = inner.session.as_mut() {
            if session.playback_url.as_ref() != Some(&resolved) {
                info!(session_id = %session.id, playback_url = %resolved, "Playback URL updated");
                session.playback_url = Some(resolved);
                self.publish(&inner);
            }
        }
    }

    /// Stop any broadcast and the channel listener.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!("Stop during shutdown failed: {e}");
        }
        self.shutdown.cancel();
    }

    fn fail_start(&self, session_id: Uuid, reason: String) -> BroadcastError {
        let mut inner = self.inner.lock();
        if inner.is_current(session_id) && inner.state == StreamState::Starting {
            let _ = inner.apply(StreamEvent::StartFailed);
            if let Some(mut session) = inner.session.take() {
                session.teardown();
            }
            inner.message = Some(format!("Failed to start stream: {reason}"));
            self.publish(&inner);
        }
        warn!(session_id = %session_id, "Session start failed: {reason}");
        BroadcastError::StartFailed(reason)
    }

    fn bind_capture(self: &Arc<Self>, session_id: Uuid, playback_url: Option<&str>) -> BroadcastResult<()> {
        let mut inner = self.inner.lock();
        if !inner.is_current(session_id) || inner.state != StreamState::Starting {
            return Err(BroadcastError::StartFailed("start superseded".to_string()));
        }

        let capture = match self.start_capture(&inner, inner.quality) {
            Ok(capture) => capture,
            Err(e) => {
                let _ = inner.apply(StreamEvent::StartFailed);
                if let Some(mut session) = inner.session.take() {
                    session.teardown();
                    self.release_server_session(session.room_id, session.target);
                }
                inner.message = Some(format!("Failed to start stream: {e}"));
                self.publish(&inner);
                error!(session_id = %session_id, "Capture could not start: {e}");
                return Err(e);
            }
        };

        let playback_url = playback_url.and_then(|raw| {
            events::resolve_playback_url(&self.settings.public_origin, raw)
                .map_err(|e| warn!(playback_url = raw, "Ignoring unparsable playback URL: {e}"))
                .ok()
        });

        inner.apply(StreamEvent::StartAcked)?;
        let Some(session) = inner.session.as_mut() else {
            return Err(BroadcastError::InvalidState("session vanished".to_string()));
        };
        session.capture = Some(capture);
        session.playback_url = playback_url;
        let room_id = session.room_id.clone();
        let cancel = session.cancel.clone();
        info!(
            room_id = %room_id,
            playback_url = session.playback_url.as_ref().map(Url::as_str),
            "Broadcast active"
        );
        inner.message = None;
        self.publish(&inner);
        drop(inner);

        self.spawn_heartbeat(session_id, room_id, cancel);
        Ok(())
    }

    /// The server already started packaging but no capture could be bound
    fn release_server_session(&self, room_id: RoomId, target: IngestTarget) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let timeout = self.settings.stop_ack_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, lifecycle.stop_session(&room_id, &target)).await {
                Ok(Ok(())) => debug!(room_id = %room_id, "Released server session"),
                Ok(Err(e)) => debug!(room_id = %room_id, "Releasing server session failed: {e}"),
                Err(_) => debug!(room_id = %room_id, "Releasing server session timed out"),
            }
        });
    }

    fn start_capture(self: &Arc<Self>, inner: &Inner, profile: QualityProfile) -> BroadcastResult<CaptureSession> {
        let Some(session) = inner.session.as_ref() else {
            return Err(BroadcastError::InvalidState("no session to capture for".to_string()));
        };
        CaptureSession::start(
            Arc::clone(&session.source),
            profile,
            self.encoders.as_ref(),
            self.transport.clone(),
            self.settings.capture,
            Arc::clone(&session.stats),
            self.error_hook(),
        )
    }

    /// Encoder runtime errors only change the status message
    fn error_hook(self: &Arc<Self>) -> EncoderErrorHook {
        let weak = Arc::downgrade(self);
        Arc::new(move |detail: String| {
            error!("Recording error: {detail}");
            if let Some(controller) = weak.upgrade() {
                let mut inner = controller.inner.lock();
                inner.message = Some(RECORDING_ERROR_MESSAGE.to_string());
                controller.publish(&inner);
            }
        })
    }

    async fn stop_with(&self, cause: StopCause) -> BroadcastResult<()> {
        let (room_id, target, session_id) = {
            let mut inner = self.inner.lock();
            if !inner.state.has_session() {
                return Ok(());
            }
            inner.apply(StreamEvent::StopRequested)?;
            if inner.session.is_none() {
                inner.apply(StreamEvent::StopCompleted)?;
                self.publish(&inner);
                return Ok(());
            }
            let Some(session) = inner.session.as_mut() else {
                return Ok(());
            };
            // Capture goes first so no chunk follows the stop request
            session.teardown();
            let handles = (session.room_id.clone(), session.target.clone(), session.id);
            inner.message = Some("Stopping stream...".to_string());
            self.publish(&inner);
            handles
        };

        let span = tracing::info_span!("broadcast_stop", room_id = %room_id, session_id = %session_id);
        let timeout = self.settings.stop_ack_timeout;
        let ack = async {
            info!("Requesting session stop");
            match tokio::time::timeout(timeout, self.lifecycle.stop_session(&room_id, &target)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(BroadcastError::StopFailed(reason))) => Err(BroadcastError::StopFailed(reason)),
                Ok(Err(e)) => Err(BroadcastError::StopFailed(e.to_string())),
                Err(_) => Err(BroadcastError::StopFailed(BroadcastError::Timeout(timeout).to_string())),
            }
        }
        .instrument(span)
        .await;

        let mut inner = self.inner.lock();
        if inner.is_current(session_id) && inner.state == StreamState::Stopping {
            inner.apply(StreamEvent::StopCompleted)?;
            inner.session = None;
        }
        inner.message = Some(match (&cause, &ack) {
            (StopCause::TransportLost, _) => CONNECTION_LOST_MESSAGE.to_string(),
            (StopCause::CaptureFailed(reason), _) => format!("Streaming stopped: {reason}"),
            (StopCause::Requested, Ok(())) => "Streaming stopped".to_string(),
            (StopCause::Requested, Err(e)) => format!("Stream stopped locally: {e}"),
        });
        self.publish(&inner);
        drop(inner);

        if let Err(e) = &ack {
            warn!(room_id = %room_id, "Stop was not acknowledged: {e}");
        } else {
            info!(room_id = %room_id, "Broadcast stopped");
        }
        ack
    }

    async fn handle_transport_lost(&self) {
        if !self.inner.lock().state.has_session() {
            return;
        }
        warn!("Signaling transport lost while broadcasting, stopping");
        if let Err(e) = self.stop_with(StopCause::TransportLost).await {
            debug!("Stop after transport loss: {e}");
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, session_id: Uuid, room_id: RoomId, cancel: CancellationToken) {
        let weak = Arc::downgrade(self);
        let period = self.settings.heartbeat_interval;
        let span = tracing::info_span!("broadcast_heartbeat", room_id = %room_id, session_id = %session_id);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(controller) = weak.upgrade() else { break };
                            if !controller.transport.is_connected() {
                                controller.handle_transport_lost().await;
                                break;
                            }
                        }
                    }
                }
                debug!("Heartbeat stopped");
            }
            .instrument(span),
        );
    }

    async fn listen(
        weak: Weak<Self>,
        mut channel_events: broadcast::Receiver<ChannelEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = channel_events.recv() => event,
            };
            let Some(controller) = weak.upgrade() else { break };
            match event {
                Ok(ChannelEvent::Disconnected) => controller.handle_transport_lost().await,
                Ok(ChannelEvent::Message { event, payload }) if event == events::STREAMING_STATUS => {
                    match serde_json::from_value::<StreamingStatus>(payload) {
                        Ok(status) => controller.apply_status(status),
                        Err(e) => warn!("Malformed {} payload: {e}", events::STREAMING_STATUS),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Channel listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Channel listener stopped");
    }

    fn build_status(&self, inner: &Inner) -> ControllerStatus {
        let session = inner.session.as_ref();
        ControllerStatus {
            state: inner.state,
            room_id: session.map(|s| s.room_id.clone()),
            quality: inner.quality,
            playback_url: session.and_then(|s| s.playback_url.clone()),
            viewer_url: session.and_then(|s| events::viewer_link(&self.settings.public_origin, &s.room_id).ok()),
            message: inner.message.clone(),
            stats: session.map(|s| s.stats.lock().snapshot()).unwrap_or_default(),
        }
    }

    fn publish(&self, inner: &Inner) {
        self.status_tx.send_replace(self.build_status(inner));
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(mut session) = self.inner.get_mut().session.take() {
            session.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{MockSessionLifecycle, SignalingLifecycle, StartAck};
    use crate::test_helpers::{FakeChannel, FakeEncoderFactory};
    use mockall::predicate::eq;
    use serde_json::json;

    fn config() -> BroadcastConfig {
        BroadcastConfig {
            public_origin: "https://meet.example.com".to_string(),
            ..BroadcastConfig::default()
        }
    }

    fn source() -> Option<Arc<MediaSource>> {
        Some(Arc::new(MediaSource::new("cam-1", true, true)))
    }

    fn accepting_lifecycle() -> MockSessionLifecycle {
        let mut lifecycle = MockSessionLifecycle::new();
        lifecycle.expect_start_session().returning(|room, _| {
            Ok(StartAck {
                playback_url: Some(format!("/hls/{room}/index.m3u8")),
            })
        });
        lifecycle.expect_stop_session().returning(|_, _| Ok(()));
        lifecycle
    }

    fn controller(
        lifecycle: MockSessionLifecycle,
    ) -> (Arc<StreamController>, Arc<FakeChannel>, FakeEncoderFactory) {
        let channel = FakeChannel::connected();
        let encoders = FakeEncoderFactory::default();
        let controller = StreamController::new(
            &config(),
            channel.clone(),
            Arc::new(lifecycle),
            Arc::new(encoders.clone()),
        )
        .unwrap();
        (controller, channel, encoders)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_binds_capture_and_resolves_urls() {
        let (controller, channel, encoders) = controller(accepting_lifecycle());

        controller
            .start(RoomId::from("r1"), source(), IngestTarget::Hls)
            .await
            .unwrap();

        assert_eq!(controller.state(), StreamState::Active);
        assert!(controller.is_capturing());
        let status = controller.status();
        assert_eq!(
            status.playback_url.as_ref().map(Url::as_str),
            Some("https://meet.example.com/hls/r1/index.m3u8")
        );
        assert_eq!(
            status.viewer_url.as_ref().map(Url::as_str),
            Some("https://meet.example.com/stream/r1")
        );
        assert_eq!(encoders.created()[0].video_bitrate_bps, QualityProfile::Medium.video_bitrate_bps());

        tokio::time::sleep(Duration::from_millis(210)).await;
        assert!(!channel.sent_chunks().is_empty());
    }

    #[tokio::test]
    async fn test_start_preconditions() {
        let (controller, channel, _) = controller(MockSessionLifecycle::new());

        let err = controller.start(RoomId::from("r1"), None, IngestTarget::Hls).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Precondition(_)));

        let silent = Some(Arc::new(MediaSource::new("none", false, false)));
        let err = controller.start(RoomId::from("r1"), silent, IngestTarget::Hls).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Precondition(_)));

        let err = controller.start(RoomId::from("  "), source(), IngestTarget::Hls).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Precondition(_)));

        let rtmp = IngestTarget::Rtmp { stream_key: String::new() };
        let err = controller.start(RoomId::from("r1"), source(), rtmp).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Precondition(_)));

        channel.set_connected_silently(false);
        let err = controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Precondition(_)));

        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_rejected_while_active() {
        let mut lifecycle = MockSessionLifecycle::new();
        lifecycle
            .expect_start_session()
            .times(1)
            .returning(|_, _| Ok(StartAck::default()));
        lifecycle.expect_stop_session().returning(|_, _| Ok(()));
        let (controller, _, encoders) = controller(lifecycle);

        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();
        let err = controller
            .start(RoomId::from("r1"), source(), IngestTarget::Hls)
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::InvalidState(_)));
        assert_eq!(encoders.created().len(), 1);
        assert_eq!(controller.state(), StreamState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_ack_returns_to_idle() {
        let mut lifecycle = MockSessionLifecycle::new();
        lifecycle
            .expect_start_session()
            .returning(|_, _| Err(BroadcastError::StartFailed("room busy".to_string())));
        let (controller, channel, encoders) = controller(lifecycle);

        let err = controller
            .start(RoomId::from("r1"), source(), IngestTarget::Hls)
            .await
            .unwrap_err();
        assert_eq!(err, BroadcastError::StartFailed("room busy".to_string()));
        assert_eq!(controller.state(), StreamState::Idle);
        assert!(encoders.created().is_empty());
        assert_eq!(
            controller.status().message.as_deref(),
            Some("Failed to start stream: room busy")
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(channel.sent_chunks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_format_releases_server_session() {
        let mut lifecycle = MockSessionLifecycle::new();
        lifecycle
            .expect_start_session()
            .returning(|_, _| Ok(StartAck::default()));
        lifecycle
            .expect_stop_session()
            .with(eq(RoomId::from("r1")), eq(IngestTarget::Hls))
            .times(1)
            .returning(|_, _| Ok(()));

        let channel = FakeChannel::connected();
        let controller = StreamController::new(
            &config(),
            channel,
            Arc::new(lifecycle),
            Arc::new(FakeEncoderFactory::supporting(&[])),
        )
        .unwrap();

        let err = controller
            .start(RoomId::from("r1"), source(), IngestTarget::Hls)
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::UnsupportedFormat(_)));
        assert_eq!(controller.state(), StreamState::Idle);

        // Let the release task run before the mock checks its expectations
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_down_before_request() {
        let (controller, channel, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;

        controller.stop().await.unwrap();
        let sent = channel.sent_chunks().len();
        assert_eq!(controller.state(), StreamState::Idle);
        assert!(!controller.is_capturing());
        assert_eq!(encoders.active_encoders(), 0);
        assert!(controller.playback_url().is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(channel.sent_chunks().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_still_idle() {
        let mut lifecycle = MockSessionLifecycle::new();
        lifecycle.expect_start_session().returning(|_, _| Ok(StartAck::default()));
        lifecycle
            .expect_stop_session()
            .returning(|_, _| Err(BroadcastError::StopFailed("gone".to_string())));
        let (controller, _, _) = controller(lifecycle);

        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();
        let err = controller.stop().await.unwrap_err();
        assert_eq!(err, BroadcastError::StopFailed("gone".to_string()));
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let mut lifecycle = MockSessionLifecycle::new();
        lifecycle.expect_stop_session().never();
        let (controller, _, _) = controller(lifecycle);

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_change_restarts_encoder() {
        let (controller, _, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();

        controller.change_quality(QualityProfile::High).await.unwrap();
        assert_eq!(controller.state(), StreamState::Active);
        assert_eq!(controller.quality(), QualityProfile::High);
        assert!(controller.is_capturing());

        let created = encoders.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].video_bitrate_bps, 2_500_000);
        assert_eq!(created[1].timeslice, created[0].timeslice);
        assert_eq!(encoders.active_encoders(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_change_noops() {
        let (controller, _, encoders) = controller(accepting_lifecycle());

        // Not active
        controller.change_quality(QualityProfile::High).await.unwrap();
        assert_eq!(controller.quality(), QualityProfile::Medium);

        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();
        // Same profile
        controller.change_quality(QualityProfile::Medium).await.unwrap();
        assert_eq!(encoders.created().len(), 1);
        assert_eq!(encoders.stop_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_window_is_silent() {
        let (controller, channel, _) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();
        tokio::time::sleep(Duration::from_millis(410)).await;

        let change = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.change_quality(QualityProfile::Low).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(controller.state(), StreamState::Restarting { .. }));
        let during = channel.sent_chunks().len();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(channel.sent_chunks().len(), during);

        change.await.unwrap().unwrap();
        assert_eq!(controller.state(), StreamState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_quality_change_keeps_previous_profile() {
        let (controller, _, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();

        encoders.fail_next_creates(1);
        let err = controller.change_quality(QualityProfile::High).await.unwrap_err();
        assert!(matches!(err, BroadcastError::Encoder(_)));
        assert_eq!(controller.state(), StreamState::Active);
        assert_eq!(controller.quality(), QualityProfile::Medium);
        assert!(controller.is_capturing());
        assert!(controller.status().message.unwrap().starts_with("Failed to change quality"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_quality_change_stops() {
        let (controller, _, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();

        encoders.fail_next_creates(2);
        controller.change_quality(QualityProfile::High).await.unwrap_err();
        assert_eq!(controller.state(), StreamState::Idle);
        assert!(!controller.is_capturing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_push_ends_session() {
        let (controller, _, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();

        controller
            .apply_status(StreamingStatus {
                streaming: false,
                ..StreamingStatus::default()
            });
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(encoders.active_encoders(), 0);
        assert_eq!(controller.status().message.as_deref(), Some(STREAM_ENDED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_starting_cancels_start() {
        let channel = FakeChannel::connected();
        let encoders = FakeEncoderFactory::default();
        let controller = StreamController::new(
            &config(),
            channel.clone(),
            Arc::new(SignalingLifecycle::new(channel.clone())),
            Arc::new(encoders.clone()),
        )
        .unwrap();
        channel.hang_requests();

        let starting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(controller.state(), StreamState::Starting);

        let stopped = controller.stop().await;
        assert!(matches!(stopped, Err(BroadcastError::StopFailed(_))));
        let started = starting.await.unwrap();
        assert!(matches!(started, Err(BroadcastError::StartFailed(_))));

        assert_eq!(controller.state(), StreamState::Idle);
        assert!(encoders.created().is_empty());
        assert_eq!(
            channel.request_events(),
            vec![events::START_HLS_STREAM.to_string(), events::STOP_HLS_STREAM.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_push_during_quality_change_ends_session() {
        let (controller, channel, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();

        let switching = tokio::spawn({
            let controller = controller.clone();
            async move { controller.change_quality(QualityProfile::High).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(controller.state(), StreamState::Restarting { .. }));

        channel.push(events::STREAMING_STATUS, json!({"streaming": false}));
        let status = controller
            .subscribe()
            .wait_for(|s| s.state == StreamState::Idle)
            .await
            .unwrap()
            .clone();
        assert_eq!(status.message.as_deref(), Some(STREAM_ENDED_MESSAGE));

        let switched = switching.await.unwrap();
        assert!(matches!(switched, Err(BroadcastError::InvalidState(_))));
        assert_eq!(encoders.created().len(), 1);
        assert_eq!(encoders.active_encoders(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_push_updates_playback_url() {
        let (controller, _, _) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();

        controller
            .apply_status(StreamingStatus {
                streaming: true,
                playback_url: Some("https://cdn.example.com/r1.m3u8".to_string()),
                streamer_id: Some("u1".to_string()),
            });
        assert_eq!(
            controller.playback_url().as_ref().map(Url::as_str),
            Some("https://cdn.example.com/r1.m3u8")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_error_reported_without_state_change() {
        let (controller, _, encoders) = controller(accepting_lifecycle());
        controller.start(RoomId::from("r1"), source(), IngestTarget::Hls).await.unwrap();
        let mut status = controller.subscribe();

        encoders.inject_error("track ended");
        status.changed().await.unwrap();
        assert_eq!(status.borrow().message.as_deref(), Some(RECORDING_ERROR_MESSAGE));
        assert_eq!(controller.state(), StreamState::Active);
    }

    #[test]
    fn test_invalid_chunk_interval_rejected() {
        let config = BroadcastConfig {
            chunk_interval_ms: 50,
            ..BroadcastConfig::default()
        };
        assert!(matches!(
            ControllerSettings::from_config(&config),
            Err(BroadcastError::Config(_))
        ));
    }
}
