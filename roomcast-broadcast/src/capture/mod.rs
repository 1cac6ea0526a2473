//! Capture: local media source → encoder → chunk cadence
//!
//! A `CaptureSession` owns one encoder instance. The encoder pushes
//! [`EncoderEvent`]s into a channel; a pump task forwards chunks to the
//! [`ChunkTransport`] and rolls the bitrate window. Stopping the session
//! closes the emit gate before returning, so nothing is sent afterwards.

pub mod format;
pub mod stats;

use parking_lot::Mutex;
use roomcast_core::QualityProfile;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::channel::{ChunkTransport, MediaChunk, SendOutcome};
use crate::error::{BroadcastError, BroadcastResult};
pub use format::{select_format, EncodingFormat, FALLBACK_FORMAT, PREFERRED_FORMATS};
pub use stats::{SharedStats, StatsSnapshot, StatsWindow};

/// Handle to a local camera/microphone capture.
///
/// Shared read-only between the capture session and any local preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub id: String,
    pub has_video: bool,
    pub has_audio: bool,
}

impl MediaSource {
    pub fn new(id: impl Into<String>, has_video: bool, has_audio: bool) -> Self {
        Self {
            id: id.into(),
            has_video,
            has_audio,
        }
    }

    #[must_use]
    pub const fn has_tracks(&self) -> bool {
        self.has_video || self.has_audio
    }
}

/// Parameters handed to the encoder factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub format: EncodingFormat,
    pub video_bitrate_bps: u32,
    pub audio_bitrate_bps: u32,
    /// Interval at which the encoder flushes a chunk
    pub timeslice: Duration,
}

#[derive(Debug)]
pub enum EncoderEvent {
    Chunk(MediaChunk),
    Error(String),
}

/// A running recorder
pub trait MediaEncoder: Send {
    /// Ask the encoder to finalize. Must tolerate repeated calls.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Creates encoders bound to a media source
pub trait EncoderFactory: Send + Sync {
    fn is_format_supported(&self, mime: &str) -> bool;

    fn create(
        &self,
        source: Arc<MediaSource>,
        settings: &EncoderSettings,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> BroadcastResult<Box<dyn MediaEncoder>>;
}

/// Settings shared by every capture session of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub timeslice: Duration,
    pub audio_bitrate_bps: u32,
    pub stats_window: Duration,
}

/// Called with a human-readable message when the encoder reports an error
pub type EncoderErrorHook = Arc<dyn Fn(String) + Send + Sync>;

pub struct CaptureSession {
    profile: QualityProfile,
    format: EncodingFormat,
    encoder: Box<dyn MediaEncoder>,
    /// `true` while chunks may be handed to the transport
    gate: Arc<Mutex<bool>>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Negotiate a format, create the encoder and start forwarding chunks.
    pub fn start(
        source: Arc<MediaSource>,
        profile: QualityProfile,
        encoders: &dyn EncoderFactory,
        transport: ChunkTransport,
        settings: CaptureSettings,
        stats: SharedStats,
        on_error: EncoderErrorHook,
    ) -> BroadcastResult<Self> {
        let format = select_format(encoders)?;
        let encoder_settings = EncoderSettings {
            format: format.clone(),
            video_bitrate_bps: profile.video_bitrate_bps(),
            audio_bitrate_bps: settings.audio_bitrate_bps,
            timeslice: settings.timeslice,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let encoder = encoders
            .create(Arc::clone(&source), &encoder_settings, tx)
            .map_err(|e| match e {
                BroadcastError::UnsupportedFormat(_) | BroadcastError::Encoder(_) => e,
                other => BroadcastError::Encoder(other.to_string()),
            })?;

        let gate = Arc::new(Mutex::new(true));
        let cancel = CancellationToken::new();

        info!(
            source_id = %source.id,
            profile = %profile,
            format = %format,
            video_bitrate_bps = encoder_settings.video_bitrate_bps,
            timeslice_ms = settings.timeslice.as_millis() as u64,
            "Capture session started"
        );

        let span = tracing::info_span!("capture_pump", profile = %profile);
        let pump = tokio::spawn(
            Self::pump(
                rx,
                transport,
                Arc::clone(&gate),
                cancel.clone(),
                stats,
                settings.stats_window,
                on_error,
            )
            .instrument(span),
        );

        Ok(Self {
            profile,
            format,
            encoder,
            gate,
            cancel,
            pump: Some(pump),
        })
    }

    #[must_use]
    pub const fn profile(&self) -> QualityProfile {
        self.profile
    }

    #[must_use]
    pub const fn format(&self) -> &EncodingFormat {
        &self.format
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.gate.lock()
    }

    /// Stop the encoder and discard anything it still has buffered.
    pub fn stop(&mut self) {
        {
            let mut open = self.gate.lock();
            if !*open {
                return;
            }
            *open = false;
        }
        self.cancel.cancel();
        if self.encoder.is_active() {
            self.encoder.stop();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        debug!(profile = %self.profile, "Capture session stopped");
    }

    async fn pump(
        mut rx: mpsc::UnboundedReceiver<EncoderEvent>,
        transport: ChunkTransport,
        gate: Arc<Mutex<bool>>,
        cancel: CancellationToken,
        stats: SharedStats,
        stats_window: Duration,
        on_error: EncoderErrorHook,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + stats_window, stats_window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut dropped: u64 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(EncoderEvent::Chunk(chunk)) => {
                        let open = gate.lock();
                        if !*open {
                            break;
                        }
                        match transport.send(chunk) {
                            SendOutcome::Sent { bytes } => stats.lock().record(bytes),
                            SendOutcome::DroppedEmpty => {}
                            SendOutcome::DroppedDisconnected | SendOutcome::Failed => dropped += 1,
                        }
                    }
                    Some(EncoderEvent::Error(message)) => {
                        warn!("Encoder reported an error: {message}");
                        on_error(message);
                    }
                    None => {
                        debug!("Encoder closed its output");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    stats.lock().roll(tokio::time::Instant::now());
                }
            }
        }

        if dropped > 0 {
            debug!(dropped, "Chunks dropped during capture");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
