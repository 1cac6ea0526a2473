//! Signaling event names and wire payloads
//!
//! The signaling channel speaks named events carrying JSON payloads; media
//! chunks travel as binary payloads under [`BINARY_STREAM`]. Payload field
//! names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{IngestTarget, RoomId};

pub const START_HLS_STREAM: &str = "stream:start:hls";
pub const STOP_HLS_STREAM: &str = "stream:stop:hls";
pub const START_RTMP_STREAM: &str = "start-youtube-stream";
pub const STOP_RTMP_STREAM: &str = "stop-youtube-stream";
pub const BINARY_STREAM: &str = "stream:binary";
pub const STREAMING_STATUS: &str = "stream:status";

/// Event name used to request a session start for the given target
#[must_use]
pub const fn start_event(target: &IngestTarget) -> &'static str {
    match target {
        IngestTarget::Hls => START_HLS_STREAM,
        IngestTarget::Rtmp { .. } => START_RTMP_STREAM,
    }
}

/// Event name used to request a session stop for the given target
#[must_use]
pub const fn stop_event(target: &IngestTarget) -> &'static str {
    match target {
        IngestTarget::Hls => STOP_HLS_STREAM,
        IngestTarget::Rtmp { .. } => STOP_RTMP_STREAM,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRequest {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
}

impl StartStreamRequest {
    #[must_use]
    pub fn new(room_id: &RoomId, target: &IngestTarget) -> Self {
        let stream_key = match target {
            IngestTarget::Hls => None,
            IngestTarget::Rtmp { stream_key } => Some(stream_key.clone()),
        };
        Self {
            room_id: room_id.as_str().to_string(),
            stream_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStreamRequest {
    pub room_id: String,
}

/// Acknowledgment returned for start and stop requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub playback_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SessionAck {
    /// Collapse the ack into the playback URL on success or an error message.
    ///
    /// An explicit `error` wins over `success`.
    pub fn into_result(self) -> Result<Option<String>, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.success {
            Ok(self.playback_url)
        } else {
            Err("server did not acknowledge the request".to_string())
        }
    }
}

/// Server push describing the broadcast state of a room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStatus {
    pub streaming: bool,
    #[serde(default)]
    pub playback_url: Option<String>,
    #[serde(default)]
    pub streamer_id: Option<String>,
}

/// Response of `GET {backend}/streams/info/{roomId}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub playback_url: Option<String>,
}

/// Resolve a server-relative playback path against an origin.
///
/// Absolute URLs are returned unchanged.
pub fn resolve_playback_url(origin: &Url, playback_url: &str) -> Result<Url, url::ParseError> {
    match Url::parse(playback_url) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => origin.join(playback_url),
        Err(e) => Err(e),
    }
}

/// Shareable link of the viewer page for a room
pub fn viewer_link(origin: &Url, room_id: &RoomId) -> Result<Url, url::ParseError> {
    origin.join(&format!("/stream/{}", room_id.as_str()))
}
