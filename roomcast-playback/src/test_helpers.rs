//! Test doubles for the playback engine

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::backend::{BackendEvent, BackendKind, LowLatencyTuning, PlayError, PlaybackBackend, PlaybackRuntime};
use crate::error::PlaybackResult;

/// How fake backends answer play()
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayPolicy {
    #[default]
    Allow,
    /// Unmuted play is blocked until a user gesture
    RequireMuted,
    Deny,
    /// play() never settles
    Hang,
}

#[derive(Default)]
struct RuntimeState {
    created: usize,
    disposed: usize,
    live: usize,
    loads: Vec<Url>,
    last_tuning: Option<LowLatencyTuning>,
    events: Option<mpsc::UnboundedSender<BackendEvent>>,
    resumes: usize,
    media_recoveries: usize,
    live_seeks: usize,
    play_calls: Vec<bool>,
    play_policy: PlayPolicy,
}

/// Runtime whose backends record every call and replay scripted events
#[derive(Clone)]
pub struct FakeRuntime {
    demux: bool,
    native: bool,
    state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
    pub fn new(demux: bool, native: bool) -> Self {
        Self {
            demux,
            native,
            state: Arc::new(Mutex::new(RuntimeState::default())),
        }
    }

    pub fn set_play_policy(&self, policy: PlayPolicy) {
        self.state.lock().play_policy = policy;
    }

    /// Deliver an event from the most recently loaded backend
    pub fn emit(&self, event: BackendEvent) {
        if let Some(tx) = self.state.lock().events.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn disposed(&self) -> usize {
        self.state.lock().disposed
    }

    /// Drop the event sender of the current backend without disposing it
    pub fn close_events(&self) {
        self.state.lock().events = None;
    }

    /// Backends created and not yet disposed
    pub fn live_backends(&self) -> usize {
        self.state.lock().live
    }

    pub fn loads(&self) -> Vec<Url> {
        self.state.lock().loads.clone()
    }

    pub fn last_tuning(&self) -> Option<LowLatencyTuning> {
        self.state.lock().last_tuning
    }

    pub fn resumes(&self) -> usize {
        self.state.lock().resumes
    }

    pub fn media_recoveries(&self) -> usize {
        self.state.lock().media_recoveries
    }

    pub fn live_seeks(&self) -> usize {
        self.state.lock().live_seeks
    }

    pub fn play_calls(&self) -> Vec<bool> {
        self.state.lock().play_calls.clone()
    }

    fn backend(&self, kind: BackendKind) -> Box<dyn PlaybackBackend> {
        let mut state = self.state.lock();
        state.created += 1;
        state.live += 1;
        Box::new(FakeBackend {
            kind,
            state: self.state.clone(),
            disposed: false,
        })
    }
}

impl PlaybackRuntime for FakeRuntime {
    fn supports_demux(&self) -> bool {
        self.demux
    }

    fn supports_native(&self) -> bool {
        self.native
    }

    fn create_demux(&self, tuning: &LowLatencyTuning) -> PlaybackResult<Box<dyn PlaybackBackend>> {
        self.state.lock().last_tuning = Some(*tuning);
        Ok(self.backend(BackendKind::Demux))
    }

    fn create_native(&self) -> PlaybackResult<Box<dyn PlaybackBackend>> {
        Ok(self.backend(BackendKind::Native))
    }
}

pub struct FakeBackend {
    kind: BackendKind,
    state: Arc<Mutex<RuntimeState>>,
    disposed: bool,
}

impl PlaybackBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn load(&mut self, url: &Url) -> PlaybackResult<mpsc::UnboundedReceiver<BackendEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.loads.push(url.clone());
        state.events = Some(tx);
        Ok(rx)
    }

    fn resume_loading(&mut self) -> bool {
        self.state.lock().resumes += 1;
        true
    }

    fn recover_media_error(&mut self) -> bool {
        if self.kind != BackendKind::Demux {
            return false;
        }
        self.state.lock().media_recoveries += 1;
        true
    }

    fn seek_to_live_edge(&mut self) {
        self.state.lock().live_seeks += 1;
    }

    fn play(&mut self, muted: bool) -> BoxFuture<'static, Result<(), PlayError>> {
        let mut state = self.state.lock();
        state.play_calls.push(muted);
        let result = match state.play_policy {
            PlayPolicy::Allow => Ok(()),
            PlayPolicy::RequireMuted if muted => Ok(()),
            PlayPolicy::RequireMuted | PlayPolicy::Deny => {
                Err(PlayError::NotAllowed("user gesture required".to_string()))
            }
            PlayPolicy::Hang => return future::pending().boxed(),
        };
        future::ready(result).boxed()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let mut state = self.state.lock();
        state.disposed += 1;
        state.live -= 1;
        state.events = None;
    }
}
