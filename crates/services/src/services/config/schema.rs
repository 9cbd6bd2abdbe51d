use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Token used when the operator leaves `webhook.token` empty. Kept for
/// zero-config lab setups; production deployments configure their own.
pub const DEFAULT_SYNC_TOKEN: &str = "SYNC_DEFAULT";

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_remote_node_id() -> String {
    "UPSTREAM".to_string()
}

fn default_batch_size() -> u64 {
    50
}

fn default_retry_max() -> i32 {
    10
}

fn default_retry_interval_seconds() -> u64 {
    5
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_trace_poll_interval_ms() -> u64 {
    500
}

fn default_ignored_columns() -> Vec<String> {
    // Bookkeeping columns the application maintains on every write; changes
    // limited to these never produce an event.
    ["LAST_SYNC_AT", "SYNC_FLAG", "ROW_VERSION", "AUDIT_USER", "AUDIT_TS"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub log_path: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: None,
            poll_interval_ms: default_trace_poll_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub listen_addr: String,
    pub remote_url: Option<String>,
    pub remote_node_id: String,
    pub token: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            remote_url: None,
            remote_node_id: default_remote_node_id(),
            token: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub hub_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub batch_size: u64,
    pub retry_max: i32,
    pub retry_interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retry_max: default_retry_max(),
            retry_interval_seconds: default_retry_interval_seconds(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub ignored_columns: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ignored_columns: default_ignored_columns(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationError("node_id is required".to_string()));
        }
        if self.database.dsn.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database.dsn is required".to_string(),
            ));
        }
        if self.relay.enabled && self.relay.hub_url.as_deref().unwrap_or("").trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "relay.hub_url is required when the relay is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Shared token presented on `X-Sync-Token` by both sides.
    pub fn sync_token(&self) -> &str {
        match self.webhook.token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => DEFAULT_SYNC_TOKEN,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.integration.retry_interval_seconds.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.integration.timeout_seconds.max(1))
    }

    pub fn batch_size(&self) -> u64 {
        self.integration.batch_size.max(1)
    }

    pub fn trace_poll_interval(&self) -> Duration {
        Duration::from_millis(self.trace.poll_interval_ms.max(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_in_defaults() {
        let raw = "node_id: STORE_1\ndatabase:\n  dsn: sqlite://agent.db\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.node_id, "STORE_1");
        assert_eq!(config.webhook.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.integration.batch_size, 50);
        assert_eq!(config.integration.retry_interval_seconds, 5);
        assert_eq!(config.sync_token(), DEFAULT_SYNC_TOKEN);
        assert!(!config.relay.enabled);
        assert!(config
            .capture
            .ignored_columns
            .contains(&"LAST_SYNC_AT".to_string()));
    }

    #[test]
    fn full_yaml_round_trips() {
        let raw = r#"
node_id: CENTRAL
database:
  dsn: sqlite://central.db
webhook:
  listen_addr: "127.0.0.1:9090"
  remote_url: "http://store1:8080/sync"
  remote_node_id: STORE_1
  token: secret
relay:
  enabled: true
  hub_url: "ws://hub:8000/relay"
  token: relay-secret
integration:
  batch_size: 10
  retry_max: 3
  retry_interval_seconds: 1
  timeout_seconds: 5
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.sync_token(), "secret");
        assert_eq!(config.webhook.remote_node_id, "STORE_1");
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(5));

        let rendered = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(back.webhook.remote_url.as_deref(), Some("http://store1:8080/sync"));
    }

    #[test]
    fn missing_dsn_fails_validation() {
        let raw = "node_id: STORE_1\ndatabase:\n  dsn: \"\"\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn relay_without_hub_url_fails_validation() {
        let raw = "node_id: STORE_1\ndatabase:\n  dsn: sqlite://a.db\nrelay:\n  enabled: true\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
