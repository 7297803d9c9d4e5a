//! Relay configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`RelayConfig::default()`]
//! 2. If a config file is given, deep-merge its JSON over the defaults
//! 3. Apply environment variable overrides
//! 4. Validate
//!
//! CLI flags are applied on top by the binary. A malformed environment value
//! is an error, not ignored.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::ConfigError;
use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;

/// Path reserved for the health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Configuration for the relay server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`, `0` for auto-assign).
    pub port: u16,
    /// Path that accepts `WebSocket` upgrades (default `"/ws"`).
    pub ws_path: String,
    /// Redis URL, or a bare `host:port` address.
    pub redis_url: String,
    /// Pub/sub channel to relay (default `"notifications"`).
    pub channel: String,
    /// How long shutdown waits for tasks before aborting them.
    pub shutdown_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            ws_path: "/ws".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            channel: "notifications".into(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        }
    }
}

impl RelayConfig {
    /// Shutdown timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Check invariants the server relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host is empty".into()));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "ws_path must start with '/': {:?}",
                self.ws_path
            )));
        }
        if self.ws_path == HEALTH_PATH {
            return Err(ConfigError::InvalidValue(format!(
                "ws_path conflicts with {HEALTH_PATH}"
            )));
        }
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue("redis_url is empty".into()));
        }
        if self.channel.trim().is_empty() {
            return Err(ConfigError::InvalidValue("channel is empty".into()));
        }
        Ok(())
    }
}

/// Normalize a Redis address to a URL.
///
/// A bare `host:port` (as in `REDIS_URL=localhost:6379`) gets the `redis://`
/// scheme; anything that already has a scheme is returned trimmed.
pub fn redis_connection_url(addr: &str) -> String {
    let addr = addr.trim();
    if addr.contains("://") {
        addr.to_owned()
    } else {
        format!("redis://{addr}")
    }
}

/// Load configuration from defaults, an optional file, and the process
/// environment.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_config`] with an injectable environment lookup.
pub fn load_config_with_env<F>(path: Option<&Path>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(RelayConfig::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading config file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };

    let mut config: RelayConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides. Empty values count as unset.
pub fn apply_env_overrides<F>(config: &mut RelayConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        config.host = v;
    }
    if let Some(v) = read("RELAY_PORT") {
        config.port = parse_env("RELAY_PORT", &v)?;
    }
    if let Some(v) = read("RELAY_WS_PATH") {
        config.ws_path = v;
    }
    if let Some(v) = read("REDIS_URL") {
        config.redis_url = v;
    }
    if let Some(v) = read("RELAY_CHANNEL") {
        config.channel = v;
    }
    if let Some(v) = read("RELAY_SHUTDOWN_TIMEOUT_SECS") {
        config.shutdown_timeout_secs = parse_env("RELAY_SHUTDOWN_TIMEOUT_SECS", &v)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_owned(),
        value: value.to_owned(),
    })
}
