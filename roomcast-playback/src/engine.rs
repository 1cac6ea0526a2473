//! Resilient live playback engine
//!
//! The engine runs as a single task owning the playback session and its one
//! backend. Callers talk to it through a [`PlaybackHandle`]: commands go in
//! over a channel, status comes out over a `watch`. All timers (reload
//! backoff, live-edge resync) live inside the task, so ending the task
//! cancels them and releases the backend.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use roomcast_core::PlaybackConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use url::Url;

use crate::backend::{
    cache_busted, select_backend, BackendError, BackendErrorType, BackendEvent, BackendKind, LowLatencyTuning,
    PlayError, PlaybackBackend, PlaybackRuntime,
};
use crate::error::{PlaybackError, PlaybackResult};
use crate::health::{HealthCounters, HealthMonitor};
use crate::retry::RetryPolicy;
use crate::state::{transition, PlaybackEvent, PlaybackState};

pub const FAILED_MESSAGE: &str = "Could not load stream after multiple attempts. Please try again later.";
pub const PLAY_BLOCKED_MESSAGE: &str = "Click play to start the stream.";

/// Upper bound on a single play() attempt
const PLAY_TIMEOUT: Duration = Duration::from_secs(10);

#[must_use]
pub fn retry_message(attempt: u32, max_retries: u32) -> String {
    format!("Loading stream... (retry {attempt}/{max_retries})")
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSettings {
    pub retry: RetryPolicy,
    pub tuning: LowLatencyTuning,
    pub live_resync_interval: Duration,
    pub stall_threshold: u32,
    pub stagnation_threshold: u32,
    pub autoplay: bool,
    pub muted: bool,
    pub max_media_recoveries: u32,
}

impl PlaybackSettings {
    pub fn from_config(config: &PlaybackConfig) -> PlaybackResult<Self> {
        if config.low_latency && config.live_resync_interval_ms == 0 {
            return Err(PlaybackError::Config("live_resync_interval_ms must be greater than 0".to_string()));
        }
        Ok(Self {
            retry: RetryPolicy::from_config(config)?,
            tuning: LowLatencyTuning::for_mode(config.low_latency),
            live_resync_interval: config.live_resync_interval(),
            stall_threshold: config.stall_threshold,
            stagnation_threshold: config.stagnation_threshold,
            autoplay: config.autoplay,
            muted: config.muted,
            max_media_recoveries: config.max_media_recoveries,
        })
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        let config = PlaybackConfig::default();
        Self {
            retry: RetryPolicy::default(),
            tuning: LowLatencyTuning::for_mode(config.low_latency),
            live_resync_interval: config.live_resync_interval(),
            stall_threshold: config.stall_threshold,
            stagnation_threshold: config.stagnation_threshold,
            autoplay: config.autoplay,
            muted: config.muted,
            max_media_recoveries: config.max_media_recoveries,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub src: Option<Url>,
    pub state: PlaybackState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_live: bool,
    pub message: Option<String>,
    pub backend: Option<BackendKind>,
    pub manifest_loaded_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub health: HealthCounters,
}

#[derive(Debug)]
enum Command {
    Load(Url),
    Reset,
}

/// Cloneable command side of a running engine
#[derive(Debug, Clone)]
pub struct PlaybackControl {
    commands: mpsc::UnboundedSender<Command>,
}

impl PlaybackControl {
    /// Play `src`. A different source resets the retry budget; the same
    /// source again is ignored.
    pub fn load(&self, src: Url) -> PlaybackResult<()> {
        self.commands
            .send(Command::Load(src))
            .map_err(|_| PlaybackError::EngineClosed)
    }

    /// Leave `Failed` (or any state) and load the current source afresh.
    pub fn reset(&self) -> PlaybackResult<()> {
        self.commands.send(Command::Reset).map_err(|_| PlaybackError::EngineClosed)
    }
}

/// Owner handle of a running engine; dropping it stops the engine.
pub struct PlaybackHandle {
    control: PlaybackControl,
    status: watch::Receiver<PlaybackStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    pub fn load(&self, src: Url) -> PlaybackResult<()> {
        self.control.load(src)
    }

    pub fn reset(&self) -> PlaybackResult<()> {
        self.control.reset()
    }

    #[must_use]
    pub fn control(&self) -> PlaybackControl {
        self.control.clone()
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    /// Stop the engine and wait until its backend is released.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Playback engine task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Disposes the backend when dropped, whatever path ends the session
struct BoundBackend {
    backend: Box<dyn PlaybackBackend>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl Drop for BoundBackend {
    fn drop(&mut self) {
        self.backend.dispose();
    }
}

/// An autoplay attempt still waiting on the platform
struct PendingPlay {
    muted: bool,
    result: BoxFuture<'static, Result<(), PlayError>>,
}

pub struct PlaybackEngine {
    runtime: Arc<dyn PlaybackRuntime>,
    settings: PlaybackSettings,
    status_tx: watch::Sender<PlaybackStatus>,

    src: Option<Url>,
    state: PlaybackState,
    retry_count: u32,
    bound: Option<BoundBackend>,
    backend_kind: Option<BackendKind>,
    health: HealthMonitor,
    /// Deadline of the pending reload
    reload_at: Option<Instant>,
    /// An in-place recovery ran and no progress was seen since
    recovery_pending: bool,
    media_recoveries: u32,
    is_live: bool,
    manifest_loaded_at: Option<DateTime<Utc>>,
    muted: bool,
    autoplay_attempted: bool,
    pending_play: Option<PendingPlay>,
    message: Option<String>,
}

impl PlaybackEngine {
    /// Start an engine task. Must be called from within a tokio runtime.
    pub fn spawn(runtime: Arc<dyn PlaybackRuntime>, settings: PlaybackSettings) -> PlaybackHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let initial = PlaybackStatus {
            max_retries: settings.retry.max_retries,
            muted: settings.muted,
            ..PlaybackStatus::default()
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let cancel = CancellationToken::new();

        let engine = Self {
            runtime,
            health: HealthMonitor::new(settings.stall_threshold, settings.stagnation_threshold),
            muted: settings.muted,
            settings,
            status_tx,
            src: None,
            state: PlaybackState::Loading,
            retry_count: 0,
            bound: None,
            backend_kind: None,
            reload_at: None,
            recovery_pending: false,
            media_recoveries: 0,
            is_live: false,
            manifest_loaded_at: None,
            autoplay_attempted: false,
            pending_play: None,
            message: None,
        };

        let span = tracing::info_span!("playback_engine");
        let task = tokio::spawn(engine.run(commands_rx, cancel.clone()).instrument(span));

        PlaybackHandle {
            control: PlaybackControl { commands: commands_tx },
            status: status_rx,
            cancel,
            task: Some(task),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let mut resync = self.settings.tuning.low_latency.then(|| {
            let period = self.settings.live_resync_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Load(src)) => self.load(src).await,
                    Some(Command::Reset) => self.reset().await,
                    None => break,
                },
                Some(()) = OptionFuture::from(self.reload_at.map(tokio::time::sleep_until)) => {
                    self.reload_at = None;
                    self.reload().await;
                }
                Some(event) = OptionFuture::from(self.bound.as_mut().map(|b| b.events.recv())) => match event {
                    Some(event) => self.on_backend_event(event),
                    None => {
                        self.bound = None;
                        self.pending_play = None;
                        if !matches!(self.state, PlaybackState::Retrying { .. } | PlaybackState::Failed) {
                            self.handle_fatal(BackendError::fatal(BackendErrorType::Other, "backend event stream closed"));
                        }
                    }
                },
                Some(result) = OptionFuture::from(self.pending_play.as_mut().map(|p| &mut p.result)) => {
                    if let Some(play) = self.pending_play.take() {
                        self.on_play_settled(play.muted, result);
                    }
                }
                Some(_) = OptionFuture::from(resync.as_mut().map(|interval| interval.tick())) => self.resync_live_edge(),
            }
        }

        self.pending_play = None;
        self.bound = None;
        self.reload_at = None;
        debug!("Playback engine stopped");
    }

    async fn load(&mut self, src: Url) {
        if self.src.as_ref() == Some(&src) {
            debug!(src = %src, "Source unchanged, ignoring load");
            return;
        }
        info!(src = %src, "Loading new source");
        self.src = Some(src);
        self.retry_count = 0;
        self.reload_at = None;
        self.is_live = false;
        self.manifest_loaded_at = None;
        self.apply(PlaybackEvent::Reset);
        self.open_session().await;
    }

    async fn reset(&mut self) {
        info!(retry_count = self.retry_count, "Playback reset requested");
        self.retry_count = 0;
        self.reload_at = None;
        self.apply(PlaybackEvent::Reset);
        if self.src.is_some() {
            self.open_session().await;
        } else {
            self.message = None;
            self.publish();
        }
    }

    async fn reload(&mut self) {
        if !matches!(self.state, PlaybackState::Retrying { .. }) {
            return;
        }
        self.apply(PlaybackEvent::ReloadStarted);
        self.open_session().await;
    }

    /// Tear down the current backend and open a fresh one on `src`
    async fn open_session(&mut self) {
        // Exactly one backend at a time: the old one goes before the next is created
        self.pending_play = None;
        self.bound = None;
        self.health.reset();
        self.recovery_pending = false;
        self.media_recoveries = 0;
        self.autoplay_attempted = false;
        self.message = None;

        let Some(src) = self.src.clone() else {
            self.publish();
            return;
        };

        let mut backend = match select_backend(self.runtime.as_ref(), &self.settings.tuning) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(src = %src, "No playback backend available: {e}");
                self.backend_kind = None;
                self.apply(PlaybackEvent::Unsupported);
                self.message = Some(e.to_string());
                self.publish();
                return;
            }
        };
        let kind = backend.kind();
        self.backend_kind = Some(kind);

        let url = cache_busted(&src, Utc::now().timestamp_millis());
        match backend.load(&url) {
            Ok(events) => {
                debug!(src = %src, backend = %kind, attempt = self.retry_count, "Backend loading");
                self.bound = Some(BoundBackend { backend, events });
                self.publish();
            }
            Err(e) => {
                backend.dispose();
                warn!(src = %src, backend = %kind, "Backend failed to load: {e}");
                self.schedule_reload();
            }
        }
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        if matches!(self.state, PlaybackState::Retrying { .. } | PlaybackState::Failed) {
            return;
        }
        let native = self.backend_kind == Some(BackendKind::Native);

        match event {
            BackendEvent::ManifestParsed { live } => {
                self.is_live |= live;
                self.became_playable();
            }
            BackendEvent::MetadataLoaded => self.became_playable(),
            BackendEvent::LevelLoaded { live } => {
                self.manifest_loaded_at = Some(Utc::now());
                if live {
                    self.is_live = true;
                    if self.settings.tuning.low_latency {
                        if let Some(bound) = self.bound.as_mut() {
                            bound.backend.seek_to_live_edge();
                        }
                    }
                }
                self.publish();
            }
            BackendEvent::BufferAppended => {
                self.health.on_buffer_appended();
                self.made_progress();
            }
            BackendEvent::Waiting => {
                if self.state == PlaybackState::Playing {
                    self.apply(PlaybackEvent::Stalled);
                }
                if native {
                    if let Some(reason) = self.health.on_waiting() {
                        warn!("Playback stalled: {reason}");
                        self.handle_fatal(BackendError::fatal(BackendErrorType::Other, reason.to_string()));
                        return;
                    }
                }
                self.publish();
            }
            BackendEvent::TimeUpdate { position, paused } => {
                let tick = self.health.on_time_update(position, paused);
                if tick.advanced {
                    self.made_progress();
                }
                if native {
                    if let Some(reason) = tick.escalation {
                        warn!(position, "Playback stalled: {reason}");
                        self.handle_fatal(BackendError::fatal(BackendErrorType::Other, reason.to_string()));
                    }
                }
            }
            BackendEvent::Error(error) if !error.fatal => {
                debug!(kind = ?error.kind, "Ignoring recoverable backend error: {}", error.details);
            }
            BackendEvent::Error(error) => self.handle_fatal(error),
        }
    }

    fn became_playable(&mut self) {
        if self.state == PlaybackState::Loading {
            self.apply(PlaybackEvent::Playable);
            info!(backend = ?self.backend_kind, is_live = self.is_live, "Stream playable");
        }
        self.message = None;
        self.publish();
        if !self.autoplay_attempted {
            self.autoplay_attempted = true;
            if self.settings.autoplay {
                self.start_play(self.muted);
            }
        }
    }

    fn made_progress(&mut self) {
        self.recovery_pending = false;
        if self.state == PlaybackState::Stalled {
            self.apply(PlaybackEvent::Resumed);
        }
        self.publish();
    }

    fn start_play(&mut self, muted: bool) {
        let Some(bound) = self.bound.as_mut() else { return };
        let result = tokio::time::timeout(PLAY_TIMEOUT, bound.backend.play(muted))
            .map(|settled| settled.unwrap_or_else(|_| Err(PlayError::Other("play() did not settle".to_string()))))
            .boxed();
        self.pending_play = Some(PendingPlay { muted, result });
    }

    fn on_play_settled(&mut self, muted: bool, result: Result<(), PlayError>) {
        match result {
            Ok(()) => debug!(muted, "Autoplay started"),
            Err(PlayError::NotAllowed(reason)) if !muted => {
                debug!("Autoplay blocked ({reason}), retrying muted");
                self.muted = true;
                self.start_play(true);
                self.publish();
            }
            Err(e) => {
                warn!(muted, "Autoplay failed: {e}");
                self.message = Some(PLAY_BLOCKED_MESSAGE.to_string());
                self.publish();
            }
        }
    }

    fn handle_fatal(&mut self, error: BackendError) {
        warn!(kind = ?error.kind, state = %self.state, "Fatal playback error: {}", error.details);

        if !self.settings.retry.can_retry(self.retry_count) {
            self.fail();
            return;
        }

        if self.state.is_rendering() && !self.recovery_pending {
            let max_media_recoveries = self.settings.max_media_recoveries;
            let media_recoveries = self.media_recoveries;
            if let Some(bound) = self.bound.as_mut() {
                let recovered = match error.kind {
                    BackendErrorType::Network => bound.backend.resume_loading(),
                    BackendErrorType::Media if media_recoveries < max_media_recoveries => {
                        let ok = bound.backend.recover_media_error();
                        if ok {
                            self.media_recoveries += 1;
                        }
                        ok
                    }
                    BackendErrorType::Media | BackendErrorType::Other => false,
                };
                if recovered {
                    info!(kind = ?error.kind, "Attempting in-place recovery");
                    self.recovery_pending = true;
                    self.message = Some(retry_message(self.retry_count + 1, self.settings.retry.max_retries));
                    self.publish();
                    return;
                }
            }
        }

        self.schedule_reload();
    }

    fn schedule_reload(&mut self) {
        if !self.settings.retry.can_retry(self.retry_count) {
            self.fail();
            return;
        }
        let delay = self.settings.retry.delay_for(self.retry_count);
        self.retry_count += 1;
        let attempt = self.retry_count;

        self.apply(PlaybackEvent::ReloadScheduled { attempt, delay });
        self.reload_at = Some(Instant::now() + delay);
        self.message = Some(retry_message(attempt, self.settings.retry.max_retries));
        info!(
            attempt,
            max_retries = self.settings.retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reload"
        );
        self.publish();
    }

    fn fail(&mut self) {
        warn!(retry_count = self.retry_count, "Giving up on playback");
        self.pending_play = None;
        self.bound = None;
        self.reload_at = None;
        self.apply(PlaybackEvent::RetriesExhausted);
        self.message = Some(FAILED_MESSAGE.to_string());
        self.publish();
    }

    fn resync_live_edge(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        if let Some(bound) = self.bound.as_mut() {
            if bound.backend.resume_loading() {
                debug!("Forced live-edge resync");
            }
        }
    }

    fn apply(&mut self, event: PlaybackEvent) {
        match transition(self.state, event) {
            Ok(next) => {
                debug!(from = %self.state, to = %next, ?event, "Playback state transition");
                self.state = next;
            }
            Err(e) => debug!("Ignoring playback event: {e}"),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(PlaybackStatus {
            src: self.src.clone(),
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.settings.retry.max_retries,
            is_live: self.is_live,
            message: self.message.clone(),
            backend: self.backend_kind,
            manifest_loaded_at: self.manifest_loaded_at,
            muted: self.muted,
            health: self.health.counters(),
        });
    }
}
