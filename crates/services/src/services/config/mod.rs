use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{
    CaptureConfig, Config, DatabaseConfig, IntegrationConfig, RelayConfig, TraceConfig,
    WebhookConfig, DEFAULT_SYNC_TOKEN,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Reads and validates the agent configuration. A missing or unreadable file
/// is fatal at startup; there is no default node identity to fall back to.
pub fn load_config_from_file(config_path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(config_path)?;
    let config: Config = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Persists the configuration for the external front-end to edit later.
pub fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let raw = serde_yaml::to_string(config)?;
    std::fs::write(config_path, raw)?;
    Ok(())
}
