//! Configuration management for curator.

pub mod paths;
pub mod settings;

pub use paths::{config_file, store_file};
pub use settings::{ApiConfig, AuthConfig, ConsumerProviderConfig, CuratorConfig, OrgProviderConfig};

use std::path::{Path, PathBuf};

use crate::error::{CuratorError, Result};

/// Load configuration from the default config file.
///
/// If the config file doesn't exist, returns default configuration.
pub fn load_config() -> Result<CuratorConfig> {
    let path = config_file()?;
    load_config_from(&path)
}

/// Load configuration from a specific path.
///
/// If the file doesn't exist, returns default configuration.
pub fn load_config_from(path: &Path) -> Result<CuratorConfig> {
    if !path.exists() {
        return Ok(CuratorConfig::default().with_env_overrides());
    }

    let contents = std::fs::read_to_string(path)?;
    let config: CuratorConfig =
        toml::from_str(&contents).map_err(|e| CuratorError::ConfigRead(e.to_string()))?;

    Ok(config.with_env_overrides())
}

/// Save configuration to a specific path.
#[allow(dead_code)]
pub fn save_config_to(config: &CuratorConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let contents =
        toml::to_string_pretty(config).map_err(|e| CuratorError::ConfigWrite(e.to_string()))?;
    std::fs::write(path, contents)?;

    Ok(())
}

/// Resolve where the credential store lives for `config`.
pub fn resolve_store_path(config: &CuratorConfig) -> Result<PathBuf> {
    match &config.storage.path {
        Some(path) => Ok(path.clone()),
        None => store_file(),
    }
}
