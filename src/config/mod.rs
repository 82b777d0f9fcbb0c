pub mod session_config;

use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::session_config::SessionConfig;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "ble_light_hub.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    /// `error`, `warn`, `info`, `debug` or `trace`. `RUST_LOG` overrides it.
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            session: SessionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads the config from a configuration file.
    pub async fn load_config(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref();

        if !fs::try_exists(file_path).await? {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, file_path: impl AsRef<Path>) -> Result<()> {
        let file_path = file_path.as_ref();
        if let Some(config_dir) = file_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(config_dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path);
        Ok(())
    }
}
