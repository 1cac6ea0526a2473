//! Encoding format negotiation

use std::fmt;

use crate::capture::EncoderFactory;
use crate::error::{BroadcastError, BroadcastResult};

/// Container/codec combinations in order of preference
pub const PREFERRED_FORMATS: &[&str] = &[
    "video/webm;codecs=vp8,opus",
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=h264,opus",
    "video/mp4;codecs=avc1,mp4a",
];

/// Minimal container every recorder is expected to accept
pub const FALLBACK_FORMAT: &str = "video/webm";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodingFormat(String);

impl EncodingFormat {
    pub fn new(mime: impl Into<String>) -> Self {
        Self(mime.into())
    }

    #[must_use]
    pub fn mime(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_FORMAT
    }
}

impl fmt::Display for EncodingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the first preferred format the encoder supports, else the fallback.
pub fn select_format(encoders: &dyn EncoderFactory) -> BroadcastResult<EncodingFormat> {
    if let Some(mime) = PREFERRED_FORMATS
        .iter()
        .find(|mime| encoders.is_format_supported(mime))
    {
        return Ok(EncodingFormat::new(*mime));
    }

    if encoders.is_format_supported(FALLBACK_FORMAT) {
        tracing::warn!("No preferred encoding format supported, using {FALLBACK_FORMAT}");
        return Ok(EncodingFormat::new(FALLBACK_FORMAT));
    }

    Err(BroadcastError::UnsupportedFormat(format!(
        "none of {} or {FALLBACK_FORMAT} can be recorded",
        PREFERRED_FORMATS.join(", ")
    )))
}
