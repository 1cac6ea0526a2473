//! Common types shared by the broadcast and playback sides

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a call room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Encoder bitrate profile for a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityProfile {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityProfile {
    /// Target video bitrate in bits per second
    #[must_use]
    pub const fn video_bitrate_bps(&self) -> u32 {
        match self {
            Self::High => 2_500_000,
            Self::Medium => 1_200_000,
            Self::Low => 500_000,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown quality profile: {other}")),
        }
    }
}

/// Where the server should send the broadcast
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestTarget {
    /// Server-side HLS packaging, watched through the viewer page
    #[default]
    Hls,
    /// Forward to a third-party RTMP ingest (e.g. YouTube Live)
    Rtmp { stream_key: String },
}

impl IngestTarget {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Rtmp { .. } => "rtmp",
        }
    }
}
