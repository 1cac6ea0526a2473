use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::types::QualityProfile;

/// Shortest and longest accepted encoder time slice
pub const MIN_CHUNK_INTERVAL_MS: u64 = 100;
pub const MAX_CHUNK_INTERVAL_MS: u64 = 250;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub broadcast: BroadcastConfig,
    pub playback: PlaybackConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Producer-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Origin used to resolve relative playback URLs and build viewer links
    pub public_origin: String,
    pub start_ack_timeout_ms: u64,
    pub stop_ack_timeout_ms: u64,
    /// Encoder time slice
    pub chunk_interval_ms: u64,
    pub audio_bitrate_bps: u32,
    /// Transport connectivity check period while broadcasting
    pub heartbeat_interval_ms: u64,
    /// Pause between stopping and re-creating the encoder on quality change
    pub quality_settle_ms: u64,
    pub stats_window_ms: u64,
    pub default_quality: QualityProfile,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            public_origin: "http://localhost:3000".to_string(),
            start_ack_timeout_ms: 10_000,
            stop_ack_timeout_ms: 5_000,
            chunk_interval_ms: 200,
            audio_bitrate_bps: 128_000,
            heartbeat_interval_ms: 5_000,
            quality_settle_ms: 500,
            stats_window_ms: 1_000,
            default_quality: QualityProfile::Medium,
        }
    }
}

impl BroadcastConfig {
    #[must_use]
    pub const fn start_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ack_timeout_ms)
    }

    #[must_use]
    pub const fn stop_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_ack_timeout_ms)
    }

    #[must_use]
    pub const fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn quality_settle(&self) -> Duration {
        Duration::from_millis(self.quality_settle_ms)
    }

    #[must_use]
    pub const fn stats_window(&self) -> Duration {
        Duration::from_millis(self.stats_window_ms)
    }
}

/// Viewer-side player settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub low_latency: bool,
    /// Forced live-edge reload period (low-latency mode only)
    pub live_resync_interval_ms: u64,
    /// Consecutive "waiting" events tolerated before a reload
    pub stall_threshold: u32,
    /// Consecutive non-advancing progress ticks tolerated before a reload
    pub stagnation_threshold: u32,
    pub autoplay: bool,
    pub muted: bool,
    /// In-place media recoveries allowed per backend instance
    pub max_media_recoveries: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            backoff_factor: 1.5,
            max_delay_ms: 10_000,
            low_latency: true,
            live_resync_interval_ms: 20_000,
            stall_threshold: 3,
            stagnation_threshold: 5,
            autoplay: true,
            muted: false,
            max_media_recoveries: 1,
        }
    }
}

impl PlaybackConfig {
    #[must_use]
    pub const fn live_resync_interval(&self) -> Duration {
        Duration::from_millis(self.live_resync_interval_ms)
    }
}

/// Viewer page settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub backend_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:4000".to_string(),
            poll_interval_ms: 10_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl ViewerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// `ROOMCAST_PLAYBACK__MAX_RETRIES` etc.; `__` separates nested keys
fn environment() -> Environment {
    Environment::with_prefix("ROOMCAST")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(environment());

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            errors.push(format!("logging.level is invalid: {}", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format must be json or pretty, got {}", self.logging.format));
        }

        let b = &self.broadcast;
        if Url::parse(&b.public_origin).is_err() {
            errors.push(format!("broadcast.public_origin is not a valid URL: {}", b.public_origin));
        }
        if !(MIN_CHUNK_INTERVAL_MS..=MAX_CHUNK_INTERVAL_MS).contains(&b.chunk_interval_ms) {
            errors.push(format!(
                "broadcast.chunk_interval_ms must be within {MIN_CHUNK_INTERVAL_MS}..={MAX_CHUNK_INTERVAL_MS}, got {}",
                b.chunk_interval_ms
            ));
        }
        for (name, value) in [
            ("broadcast.start_ack_timeout_ms", b.start_ack_timeout_ms),
            ("broadcast.stop_ack_timeout_ms", b.stop_ack_timeout_ms),
            ("broadcast.heartbeat_interval_ms", b.heartbeat_interval_ms),
            ("broadcast.stats_window_ms", b.stats_window_ms),
            ("playback.live_resync_interval_ms", self.playback.live_resync_interval_ms),
            ("viewer.poll_interval_ms", self.viewer.poll_interval_ms),
            ("viewer.request_timeout_ms", self.viewer.request_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }
        if b.audio_bitrate_bps == 0 {
            errors.push("broadcast.audio_bitrate_bps must be greater than zero".to_string());
        }

        let p = &self.playback;
        if !(p.backoff_factor >= 1.0 && p.backoff_factor.is_finite()) {
            errors.push(format!("playback.backoff_factor must be >= 1.0, got {}", p.backoff_factor));
        }
        if p.base_delay_ms > p.max_delay_ms {
            errors.push(format!(
                "playback.base_delay_ms ({}) exceeds playback.max_delay_ms ({})",
                p.base_delay_ms, p.max_delay_ms
            ));
        }

        if Url::parse(&self.viewer.backend_url).is_err() {
            errors.push(format!("viewer.backend_url is not a valid URL: {}", self.viewer.backend_url));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broadcast.chunk_interval(), Duration::from_millis(200));
        assert_eq!(config.playback.max_retries, 5);
        assert_eq!(config.viewer.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.broadcast.chunk_interval_ms = 1_000;
        config.playback.backoff_factor = 0.5;
        config.viewer.backend_url = "not a url".to_string();
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("chunk_interval_ms")));
        assert!(errors.iter().any(|e| e.contains("backoff_factor")));
        assert!(errors.iter().any(|e| e.contains("backend_url")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_validate_rejects_base_above_cap() {
        let mut config = Config::default();
        config.playback.base_delay_ms = 20_000;
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("exceeds"));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broadcast:\n  chunk_interval_ms: 150\n  default_quality: high\nplayback:\n  max_retries: 3\n"
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.broadcast.chunk_interval_ms, 150);
        assert_eq!(config.broadcast.default_quality, QualityProfile::High);
        assert_eq!(config.playback.max_retries, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.viewer.backend_url, "http://localhost:4000");
    }

    #[test]
    fn test_env_keys_nest_on_double_underscore() {
        let vars: config::Map<String, String> = [
            ("ROOMCAST_PLAYBACK__MAX_RETRIES", "7"),
            ("ROOMCAST_VIEWER__BACKEND_URL", "http://api.local"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config: Config = ConfigBuilder::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.playback.max_retries, 7);
        assert_eq!(config.viewer.backend_url, "http://api.local");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/roomcast.yaml").unwrap();
        assert_eq!(config.playback.base_delay_ms, 1_000);
    }
}
