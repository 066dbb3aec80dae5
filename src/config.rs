//! Application configuration
//!
//! Defaults come from the embedded `config.toml`; a handful of deployment
//! specific keys can be overridden from the environment (or a `.env` file).

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const CONFIG_TOML: &str = include_str!("../config.toml");

/// Environment variable overriding `api.base_url`
const ENV_API_URL: &str = "FACEMARK_API_URL";

/// Environment variable overriding `capture.frames_dir`
const ENV_FRAMES_DIR: &str = "FACEMARK_FRAMES_DIR";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    pub api: ApiConfig,
    pub transport: TransportConfig,
    pub capture: CaptureConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TransportConfig {
    pub connect_timeout_secs: u64,
    pub outbound_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CaptureConfig {
    pub frame_interval_ms: u64,
    pub frames_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DirectoryConfig {
    pub refresh_interval_secs: u64,
    pub auto_select: bool,
}

impl Config {
    /// Load the embedded defaults, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is the normal case
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded environment from {:?}", path);
        }
        let mut config = Self::from_toml(CONFIG_TOML)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api.base_url = url.trim().to_string();
        }
        if let Some(dir) = lookup(ENV_FRAMES_DIR).filter(|v| !v.trim().is_empty()) {
            self.capture.frames_dir = PathBuf::from(dir);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api.base_url).map_err(|e| ConfigError::Invalid {
            key: "api.base_url",
            message: e.to_string(),
        })?;
        if self.capture.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "capture.frame_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.directory.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "directory.refresh_interval_secs",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.transport.outbound_queue == 0 {
            return Err(ConfigError::Invalid {
                key: "transport.outbound_queue",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.capture.frame_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.directory.refresh_interval_secs)
    }
}
