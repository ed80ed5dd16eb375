//! Configuration resolution for `EchoRelay`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/echorelay/settings.json)
//! 3. Explicit settings file (`--config`)
//! 4. Environment variables (`ECHORELAY_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete `EchoRelay` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub relay: RelaySettings,
    pub log: LogConfig,
}

/// Connection settings for the local MQTT broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Stable client id. Generated at startup when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Start a clean MQTT session. Off by default so the broker keeps the
    /// subscription across reconnects.
    pub clean_session: bool,
    /// Capacity of the client request channel.
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: false,
            request_capacity: 100,
        }
    }
}

/// Relay behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    /// Bounded wait for subscribe and publish acknowledgements (seconds).
    pub operation_timeout_secs: u64,
    /// Publishes allowed to wait for acknowledgement at the same time.
    pub max_in_flight_publishes: usize,
    /// Publish jobs allowed to queue behind the in-flight ones.
    pub publish_queue_capacity: usize,
    pub resubscribe: ResubscribeConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 10,
            max_in_flight_publishes: 32,
            publish_queue_capacity: 1024,
            resubscribe: ResubscribeConfig::default(),
        }
    }
}

/// Re-subscribe behavior after the transport closes the subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResubscribeConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ResubscribeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(Error::Configuration("broker host is empty".into()));
        }
        if self.broker.port == 0 {
            return Err(Error::Configuration("broker port must be non-zero".into()));
        }
        if let Some(id) = self
            .broker
            .client_id
            .as_ref()
            .filter(|id| id.is_empty() || id.starts_with(' '))
        {
            return Err(Error::Configuration(format!(
                "client id {id:?} must be non-empty and not start with a space"
            )));
        }
        if self.broker.request_capacity == 0 {
            return Err(Error::Configuration(
                "broker request capacity must be non-zero".into(),
            ));
        }
        if self.relay.operation_timeout_secs == 0 {
            return Err(Error::Configuration(
                "operation timeout must be non-zero".into(),
            ));
        }
        if self.relay.max_in_flight_publishes == 0 || self.relay.publish_queue_capacity == 0 {
            return Err(Error::Configuration(
                "publish pool limits must be non-zero".into(),
            ));
        }
        let resub = &self.relay.resubscribe;
        if resub.multiplier < 1.0 || !resub.multiplier.is_finite() {
            return Err(Error::Configuration(format!(
                "resubscribe multiplier must be >= 1.0, got {}",
                resub.multiplier
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicitly requested file must exist; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Configuration(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("echorelay").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `ECHORELAY_*` overrides. Unparseable numeric values are ignored.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("ECHORELAY_HOST") {
        config.broker.host = val;
    }
    if let Some(n) = var("ECHORELAY_PORT").and_then(|v| v.parse().ok()) {
        config.broker.port = n;
    }
    if let Some(val) = var("ECHORELAY_CLIENT_ID") {
        config.broker.client_id = Some(val);
    }
    if let Some(val) = var("ECHORELAY_USERNAME") {
        config.broker.username = Some(val);
    }
    if let Some(val) = var("ECHORELAY_PASSWORD") {
        config.broker.password = Some(val);
    }
    if let Some(n) = var("ECHORELAY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.relay.operation_timeout_secs = n;
    }
    if let Some(n) = var("ECHORELAY_MAX_IN_FLIGHT").and_then(|v| v.parse().ok()) {
        config.relay.max_in_flight_publishes = n;
    }
    if let Some(b) = var("ECHORELAY_RESUBSCRIBE").and_then(|v| parse_bool(&v)) {
        config.relay.resubscribe.enabled = b;
    }
    if let Some(val) = var("ECHORELAY_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(b) = var("ECHORELAY_LOG_JSON").and_then(|v| parse_bool(&v)) {
        config.log.json = b;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
