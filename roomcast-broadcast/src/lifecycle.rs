//! Server-side session lifecycle
//!
//! The server packages the chunk stream into HLS (or forwards it to an RTMP
//! ingest). Starting and stopping that pipeline is a request/ack exchange
//! behind [`SessionLifecycle`].

use async_trait::async_trait;
use roomcast_core::events::{self, SessionAck, StartStreamRequest, StopStreamRequest};
use roomcast_core::{IngestTarget, RoomId};
use std::sync::Arc;
use tracing::debug;

use crate::channel::MessageChannel;
use crate::error::{BroadcastError, BroadcastResult};

/// Successful start acknowledgment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartAck {
    /// Possibly relative to the public origin
    pub playback_url: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    async fn start_session(&self, room_id: &RoomId, target: &IngestTarget) -> BroadcastResult<StartAck>;

    async fn stop_session(&self, room_id: &RoomId, target: &IngestTarget) -> BroadcastResult<()>;
}

/// Session lifecycle driven over the signaling channel's request/ack primitive
pub struct SignalingLifecycle {
    channel: Arc<dyn MessageChannel>,
}

impl SignalingLifecycle {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    async fn exchange(&self, event: &str, payload: serde_json::Value) -> BroadcastResult<SessionAck> {
        if !self.channel.is_connected() {
            return Err(BroadcastError::Transport("signaling channel is not connected".to_string()));
        }
        let raw = self.channel.request(event, payload).await?;
        debug!(event, ack = %raw, "Received session ack");
        if raw.is_null() {
            return Err(BroadcastError::Transport(format!("no acknowledgment payload for {event}")));
        }
        Ok(serde_json::from_value(raw)?)
    }
}

#[async_trait]
impl SessionLifecycle for SignalingLifecycle {
    async fn start_session(&self, room_id: &RoomId, target: &IngestTarget) -> BroadcastResult<StartAck> {
        let request = StartStreamRequest::new(room_id, target);
        let ack = self
            .exchange(events::start_event(target), serde_json::to_value(&request)?)
            .await
            .map_err(|e| BroadcastError::StartFailed(e.to_string()))?;

        let playback_url = ack.into_result().map_err(BroadcastError::StartFailed)?;
        Ok(StartAck { playback_url })
    }

    async fn stop_session(&self, room_id: &RoomId, target: &IngestTarget) -> BroadcastResult<()> {
        let request = StopStreamRequest {
            room_id: room_id.as_str().to_string(),
        };
        let ack = self
            .exchange(events::stop_event(target), serde_json::to_value(&request)?)
            .await
            .map_err(|e| BroadcastError::StopFailed(e.to_string()))?;

        ack.into_result().map(|_| ()).map_err(BroadcastError::StopFailed)
    }
}
