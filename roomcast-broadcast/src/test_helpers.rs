//! Fakes for the signaling channel and the media encoder

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::capture::{
    EncoderEvent, EncoderFactory, EncoderSettings, MediaEncoder, MediaSource, PREFERRED_FORMATS,
};
use crate::channel::{ChannelEvent, MediaChunk, MessageChannel};
use crate::error::{BroadcastError, BroadcastResult};

pub const FAKE_CHUNK_BYTES: usize = 1_024;

type Responder = Arc<dyn Fn(&str, &Value) -> BroadcastResult<Value> + Send + Sync>;

/// In-memory signaling channel.
///
/// Acks every request with `{"success": true, "playbackUrl": "/hls/{roomId}/index.m3u8"}`
/// unless a responder is installed.
pub struct FakeChannel {
    connected: AtomicBool,
    hang: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
    requests: Mutex<Vec<(String, Value)>>,
    responder: Mutex<Option<Responder>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl FakeChannel {
    pub fn connected() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            hang: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            events,
        })
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            let event = if connected {
                ChannelEvent::Connected
            } else {
                ChannelEvent::Disconnected
            };
            let _ = self.events.send(event);
        }
    }

    /// Flip connectivity without notifying subscribers
    pub fn set_connected_silently(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn respond_with(&self, f: impl Fn(&str, &Value) -> BroadcastResult<Value> + Send + Sync + 'static) {
        *self.responder.lock() = Some(Arc::new(f));
    }

    /// Never answer requests
    pub fn hang_requests(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn push(&self, event: &str, payload: Value) {
        let _ = self.events.send(ChannelEvent::Message {
            event: event.to_string(),
            payload,
        });
    }

    pub fn sent_chunks(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().clone()
    }

    pub fn request_events(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(event, _)| event.clone()).collect()
    }
}

#[async_trait]
impl MessageChannel for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit_binary(&self, _event: &str, payload: Bytes) -> BroadcastResult<()> {
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn request(&self, event: &str, payload: Value) -> BroadcastResult<Value> {
        self.requests.lock().push((event.to_string(), payload.clone()));
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let responder = self.responder.lock().clone();
        match responder {
            Some(f) => f(event, &payload),
            None => {
                let room = payload.get("roomId").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({"success": true, "playbackUrl": format!("/hls/{room}/index.m3u8")}))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct FactoryState {
    supported: Option<Vec<String>>,
    created: Mutex<Vec<EncoderSettings>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<EncoderEvent>>>,
    fail_creates: AtomicUsize,
    active: AtomicUsize,
    stop_calls: AtomicUsize,
}

/// Encoder factory whose encoders emit a fixed-size chunk every time slice
#[derive(Clone, Default)]
pub struct FakeEncoderFactory {
    state: Arc<FactoryState>,
}

impl FakeEncoderFactory {
    pub fn supporting(formats: &[&str]) -> Self {
        Self {
            state: Arc::new(FactoryState {
                supported: Some(formats.iter().map(ToString::to_string).collect()),
                ..FactoryState::default()
            }),
        }
    }

    /// Make the next `n` calls to `create` fail
    pub fn fail_next_creates(&self, n: usize) {
        self.state.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<EncoderSettings> {
        self.state.created.lock().clone()
    }

    pub fn active_encoders(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.state.stop_calls.load(Ordering::SeqCst)
    }

    /// Report a runtime error from the most recently created encoder
    pub fn inject_error(&self, message: &str) {
        if let Some(tx) = self.state.senders.lock().last() {
            let _ = tx.send(EncoderEvent::Error(message.to_string()));
        }
    }
}

impl EncoderFactory for FakeEncoderFactory {
    fn is_format_supported(&self, mime: &str) -> bool {
        match &self.state.supported {
            Some(list) => list.iter().any(|m| m == mime),
            None => PREFERRED_FORMATS.contains(&mime),
        }
    }

    fn create(
        &self,
        _source: Arc<MediaSource>,
        settings: &EncoderSettings,
        events: mpsc::UnboundedSender<EncoderEvent>,
    ) -> BroadcastResult<Box<dyn MediaEncoder>> {
        let pending_failures = self.state.fail_creates.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.state.fail_creates.store(pending_failures - 1, Ordering::SeqCst);
            return Err(BroadcastError::Encoder("device busy".to_string()));
        }

        self.state.created.lock().push(settings.clone());
        self.state.senders.lock().push(events.clone());
        self.state.active.fetch_add(1, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let timeslice = settings.timeslice;
        tokio::spawn(produce_chunks(events, timeslice, cancel.clone()));

        Ok(Box::new(FakeEncoder {
            state: Arc::clone(&self.state),
            cancel,
            active: true,
        }))
    }
}

async fn produce_chunks(events: mpsc::UnboundedSender<EncoderEvent>, timeslice: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let chunk = MediaChunk::new(vec![0u8; FAKE_CHUNK_BYTES]);
                if events.send(EncoderEvent::Chunk(chunk)).is_err() {
                    break;
                }
            }
        }
    }
}

struct FakeEncoder {
    state: Arc<FactoryState>,
    cancel: CancellationToken,
    active: bool,
}

impl MediaEncoder for FakeEncoder {
    fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.cancel.cancel();
        self.state.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for FakeEncoder {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            self.cancel.cancel();
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
