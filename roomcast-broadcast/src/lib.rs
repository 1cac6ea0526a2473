//! Roomcast broadcast side
//!
//! Turns a participant's local camera/microphone into a live stream: the
//! controller negotiates a server-side session, a capture session encodes
//! the media into small chunks, and the chunks travel over the signaling
//! channel to the server, which packages them for HLS viewers or forwards
//! them to an RTMP ingest.
//!
//! ## Architecture
//!
//! - **`StreamController`**: the start / stop / quality-change state machine
//! - **`CaptureSession`**: one encoder instance plus the chunk pump
//! - **`ChunkTransport`**: drop-on-disconnect binary sends over a `MessageChannel`
//! - **`SessionLifecycle`**: server-side session start/stop (request/ack)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_broadcast::{SignalingLifecycle, StreamController};
//!
//! let lifecycle = Arc::new(SignalingLifecycle::new(channel.clone()));
//! let controller = StreamController::new(&config.broadcast, channel, lifecycle, encoders)?;
//! controller.start(RoomId::from("r1"), Some(source), IngestTarget::Hls).await?;
//! controller.change_quality(QualityProfile::High).await?;
//! controller.stop().await?;
//! ```

pub mod capture;
pub mod channel;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod state;

#[cfg(test)]
pub mod test_helpers;

pub use capture::{
    CaptureSession, EncoderEvent, EncoderFactory, EncoderSettings, EncodingFormat, MediaEncoder, MediaSource,
    StatsSnapshot,
};
pub use channel::{ChannelEvent, ChunkTransport, MediaChunk, MessageChannel, SendOutcome};
pub use controller::{ControllerStatus, StreamController};
pub use error::{BroadcastError, BroadcastResult};
pub use lifecycle::{SessionLifecycle, SignalingLifecycle, StartAck};
pub use state::{StreamEvent, StreamState};
