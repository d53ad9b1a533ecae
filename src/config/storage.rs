//! Loading and saving the engine configuration file.

use crate::config::schema::AppConfig;
use crate::error::{Result, TabflowError};
use std::fs;
use std::path::PathBuf;

/// Platform location of `config.toml`: the XDG config dir on Linux and
/// Windows, the app data dir on macOS.
pub fn config_path() -> PathBuf {
    let base = if cfg!(target_os = "macos") {
        dirs::data_dir().map(|p| p.join("com.tabflow.app"))
    } else {
        dirs::config_dir().map(|p| p.join("tabflow"))
    };
    base.unwrap_or_else(|| PathBuf::from(".")).join("config.toml")
}

/// Load the configuration. A missing file is not an error: defaults are
/// written out once and returned.
pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, writing defaults");
        let config = AppConfig::default();
        save_config(&config)?;
        return Ok(config);
    }

    let content = fs::read_to_string(&path)
        .map_err(|e| TabflowError::Config(format!("cannot read {}: {e}", path.display())))?;
    let config = toml::from_str(&content)?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TabflowError::Config(format!("cannot create {}: {e}", parent.display())))?;
    }
    fs::write(&path, toml::to_string_pretty(config)?)
        .map_err(|e| TabflowError::Config(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_file_name() {
        let path = config_path();
        assert!(path.ends_with("config.toml"));
    }
}
