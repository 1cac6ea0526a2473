//! Signaling channel seam and the chunk transport built on top of it
//!
//! The channel itself (a socket connection to the signaling server) lives
//! outside this crate and is injected as `Arc<dyn MessageChannel>`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use roomcast_core::events::BINARY_STREAM;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::BroadcastResult;

/// One encoded slice of media as produced by the encoder.
///
/// Not `Clone`: a chunk is handed to the transport by value and is gone after
/// the send.
#[derive(Debug)]
pub struct MediaChunk {
    data: Bytes,
    produced_at: DateTime<Utc>,
}

impl MediaChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            produced_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub const fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Connection-level notifications and server pushes
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Message {
        event: String,
        payload: serde_json::Value,
    },
}

/// External signaling connection
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Current connectivity, readable at any time
    fn is_connected(&self) -> bool;

    /// Fire-and-forget binary emit
    fn emit_binary(&self, event: &str, payload: Bytes) -> BroadcastResult<()>;

    /// Emit a JSON payload and wait for the server's acknowledgment
    async fn request(&self, event: &str, payload: serde_json::Value) -> BroadcastResult<serde_json::Value>;

    /// Subscribe to connection events and server pushes
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// What happened to a chunk handed to [`ChunkTransport::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { bytes: usize },
    DroppedEmpty,
    DroppedDisconnected,
    Failed,
}

/// Sends media chunks over the signaling channel.
///
/// Live media favors freshness: chunks that cannot go out right now are
/// dropped, never queued.
#[derive(Clone)]
pub struct ChunkTransport {
    channel: Arc<dyn MessageChannel>,
}

impl ChunkTransport {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn send(&self, chunk: MediaChunk) -> SendOutcome {
        if chunk.is_empty() {
            return SendOutcome::DroppedEmpty;
        }
        if !self.channel.is_connected() {
            trace!(bytes = chunk.len(), "Dropping chunk while disconnected");
            return SendOutcome::DroppedDisconnected;
        }

        let bytes = chunk.len();
        match self.channel.emit_binary(BINARY_STREAM, chunk.into_bytes()) {
            Ok(()) => SendOutcome::Sent { bytes },
            Err(e) => {
                tracing::debug!("Chunk emit failed: {e}");
                SendOutcome::Failed
            }
        }
    }
}
