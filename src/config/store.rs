//! Configuration Storage
//!
//! Persist session configuration to disk.

use super::{ConfigError, SessionConfig};
use std::path::Path;

/// Load a session configuration from a TOML file.
///
/// A missing file yields the defaults; the caller still has to run
/// [`SessionConfig::validate`] before using the result.
pub fn load_config(path: &Path) -> Result<SessionConfig, ConfigError> {
    if !path.exists() {
        tracing::info!("No config file at {:?}, using defaults", path);
        return Ok(SessionConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: SessionConfig = toml::from_str(&content)?;

    tracing::info!("Config loaded from {:?}", path);
    Ok(config)
}

/// Save a session configuration to a TOML file.
pub fn save_config(config: &SessionConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}
