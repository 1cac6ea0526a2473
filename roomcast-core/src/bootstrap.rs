//! Configuration discovery and fail-fast validation

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::Config;

/// Names an explicit config file; it must exist when set
pub const CONFIG_PATH_ENV: &str = "ROOMCAST_CONFIG_PATH";

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Discover, load and validate the configuration
///
/// The config file is `ROOMCAST_CONFIG_PATH` when set, otherwise
/// `./config.yaml` when present. `ROOMCAST_*` variables are layered on top.
pub fn load_config() -> Result<Config> {
    let path = match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => Some(PathBuf::from(path)),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };
    load_config_from(path.as_deref())
}

/// Load `path` (or the environment alone) and reject anything that does not
/// parse or validate.
pub fn load_config_from(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            let name = path
                .to_str()
                .with_context(|| format!("Config path is not valid UTF-8: {}", path.display()))?;
            Config::from_file(name).with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => Config::from_env().context("Failed to load config from environment")?,
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        );
    }

    info!(
        config_file = ?path.map(|p| p.display().to_string()),
        public_origin = %config.broadcast.public_origin,
        backend_url = %config.viewer.backend_url,
        "Configuration loaded and validated"
    );

    Ok(config)
}
