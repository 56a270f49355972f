pub mod scanner_config;
pub mod session_config;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::scanner_config::ScannerConfig;
use crate::config::session_config::SessionConfig;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "blebridge.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub scanner: ScannerConfig,
}

impl AppConfig {
    /// Loads the config from `dir`, falling back to defaults when no file exists.
    pub async fn load_config<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let file_path = dir.as_ref().join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;
        config.validate()?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the config into `dir`, creating the directory if needed.
    pub async fn save_config<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        ensure_directory_exists(dir).await?;

        let file_path = dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path_str);
        Ok(())
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        self.session.validate()?;
        self.scanner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("config");
        let mut config = AppConfig::default();
        config.session.operation_timeout_secs = 3;
        config.scanner.rssi_threshold = -80;
        config.save_config(&nested).await.unwrap();

        let loaded = AppConfig::load_config(&nested).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "session": { "adapter": "hci1" } }"#,
        )
        .await
        .unwrap();
        let config = AppConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config.session.adapter, "hci1");
        assert_eq!(config.scanner, ScannerConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "session": { "event_channel_capacity": 0 } }"#,
        )
        .await
        .unwrap();
        assert!(AppConfig::load_config(dir.path()).await.is_err());
    }
}
