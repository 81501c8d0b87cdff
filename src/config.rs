//! Controller configuration file
//!
//! Defaults for the controller live in ~/.outpost/config.json. Command line
//! flags and environment variables override anything set here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutpostConfig {
    /// Database for listener jobs and beacons (in-memory when unset)
    pub database_url: Option<String>,

    /// Callback host baked into generated agents
    pub lhost: Option<String>,

    /// Port of the session listener started on launch
    pub lport: u16,

    /// Bind host of the session listener started on launch
    pub listen_host: String,

    /// Start a session listener on launch
    pub listen_on_start: bool,

    pub request_timeout_secs: u64,
    pub handshake_timeout_secs: u64,

    pub send_queue_capacity: usize,
    pub recv_queue_capacity: usize,

    /// Agent build script, see `generate`
    pub generator: Option<PathBuf>,

    /// msfvenom executable used by `msf` and `inject`
    pub msfvenom: Option<PathBuf>,
}

impl Default for OutpostConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            lhost: None,
            lport: 8888,
            listen_host: "0.0.0.0".to_string(),
            listen_on_start: true,
            request_timeout_secs: 10,
            handshake_timeout_secs: 30,
            send_queue_capacity: 64,
            recv_queue_capacity: 64,
            generator: None,
            msfvenom: None,
        }
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".outpost").join("config.json"))
    }

    /// Load the configuration, falling back to defaults if the file is missing
    pub fn load(path: &Path) -> Result<OutpostConfig> {
        if !path.exists() {
            return Ok(OutpostConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: OutpostConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn save(path: &Path, config: &OutpostConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, OutpostConfig::default());
        assert_eq!(config.lport, 8888);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = OutpostConfig {
            database_url: Some("sqlite://outpost.db?mode=rwc".to_string()),
            lhost: Some("10.0.0.2".to_string()),
            listen_on_start: false,
            ..Default::default()
        };
        ConfigManager::save(&path, &config).unwrap();

        assert_eq!(ConfigManager::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "lport": 9443, "msfvenom": "/opt/msf/msfvenom" }"#).unwrap();

        let config = ConfigManager::load(&path).unwrap();
        assert_eq!(config.lport, 9443);
        assert_eq!(config.msfvenom, Some(PathBuf::from("/opt/msf/msfvenom")));
        assert_eq!(config.request_timeout_secs, 10);
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = ConfigManager::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
