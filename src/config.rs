//! Configuration loader and validator for the medicine batch-entry service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub batch: Batch,
    pub vision: Vision,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Batch-session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub debounce_seconds: u32,
}

/// Vision API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vision {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            debounce_seconds: self.batch.debounce_seconds,
            ..SessionConfig::default()
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.batch.debounce_seconds == 0 {
        return Err(ConfigError::Invalid("batch.debounce_seconds must be > 0"));
    }

    if cfg.vision.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("vision.api_key must be non-empty"));
    }
    if cfg.vision.model.trim().is_empty() {
        return Err(ConfigError::Invalid("vision.model must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.vision.base_url).is_err() {
        return Err(ConfigError::Invalid("vision.base_url must be a valid URL"));
    }

    Ok(())
}

/// Returns an example YAML document matching the schema.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60

batch:
  debounce_seconds: 5

vision:
  api_key: "YOUR_VISION_API_KEY"
  base_url: "https://vision.example.com/"
  model: "med-vision-1"
"#
}
