//! Platform-specific path utilities for curator.

use std::path::PathBuf;

use crate::error::{CuratorError, Result};

const APP_DIR: &str = "community-curator";

/// Get the configuration directory for curator.
///
/// - Linux: `~/.config/community-curator`
/// - macOS: `~/Library/Application Support/community-curator`
/// - Windows: `%APPDATA%\community-curator`
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| CuratorError::Config("Cannot determine config directory".to_string()))?;
    Ok(base.join(APP_DIR))
}

/// Get the data directory for curator.
///
/// - Linux: `~/.local/share/community-curator`
/// - macOS: `~/Library/Application Support/community-curator`
/// - Windows: `%APPDATA%\community-curator`
pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .ok_or_else(|| CuratorError::Config("Cannot determine data directory".to_string()))?;
    Ok(base.join(APP_DIR))
}

/// Get the main configuration file path.
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Default location of the credential store file.
pub fn store_file() -> Result<PathBuf> {
    Ok(data_dir()?.join("curator-store.json"))
}
