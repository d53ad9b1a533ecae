use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the persisted workflow state file.
    pub data_dir: PathBuf,

    /// WebSocket endpoint of the page bridge the engine drives steps through.
    #[serde(default = "default_bridge_endpoint")]
    pub bridge_endpoint: String,

    /// Engine-level defaults.
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            bridge_endpoint: default_bridge_endpoint(),
            engine: EngineSettings::default(),
        }
    }
}

impl AppConfig {
    /// Default data directory under the user's home.
    fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .map(|p| p.join(".tabflow"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Path of the persisted workflow state file.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }
}

fn default_bridge_endpoint() -> String {
    "ws://127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Timeout applied to every page RPC round-trip (ms).
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout(),
        }
    }
}

fn default_rpc_timeout() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.state_path().ends_with("state.json"));
        assert_eq!(config.bridge_endpoint, "ws://127.0.0.1:8787");
        assert_eq!(config.engine.rpc_timeout_ms, 30_000);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine.rpc_timeout_ms, config.engine.rpc_timeout_ms);
    }
}
