//! Shared building blocks for roomcast
//!
//! - `config`    - layered configuration (defaults, file, `ROOMCAST_*` env)
//! - `bootstrap` - config discovery and fail-fast validation
//! - `logging`   - tracing subscriber setup
//! - `types`     - room ids, quality profiles, ingest targets
//! - `events`    - signaling event names and wire payloads

pub mod bootstrap;
pub mod config;
pub mod events;
pub mod logging;
pub mod types;

pub use bootstrap::{load_config, load_config_from};
pub use config::{BroadcastConfig, Config, LoggingConfig, PlaybackConfig, ViewerConfig};
pub use types::{IngestTarget, QualityProfile, RoomId};
