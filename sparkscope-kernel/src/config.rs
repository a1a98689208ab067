//! Kernel configuration, read from YAML at startup.

use crate::discovery::DiscoveryOptions;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::session::SessionConfig;
use crate::topic::SPARKPLUG_B_NAMESPACE;
use crate::tree::DEFAULT_HISTORY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "SPARKSCOPE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "sparkscope.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub discovery: DiscoveryOptions,
    /// Defaults for sessions opened by the discovery bridge.
    pub sessions: SessionConfig,
    pub sparkplug: SparkplugConf,
    pub bridge: BridgeConf,
    pub health: HealthConf,
    pub retention: RetentionConf,
    pub event_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryOptions::default(),
            sessions: SessionConfig::default(),
            sparkplug: SparkplugConf::default(),
            bridge: BridgeConf::default(),
            health: HealthConf::default(),
            retention: RetentionConf::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparkplugConf {
    pub namespaces: Vec<String>,
    pub history_capacity: usize,
}

impl Default for SparkplugConf {
    fn default() -> Self {
        Self {
            namespaces: vec![SPARKPLUG_B_NAMESPACE.to_string()],
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConf {
    pub auto_connect: bool,
    /// Used for brokers that refuse anonymous clients.
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for BridgeConf {
    fn default() -> Self {
        Self {
            auto_connect: true,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConf {
    pub interval_secs: u64,
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

/// Every `interval_secs` the kernel drops buffered messages and topic stats
/// older than `max_age_secs`, and forgets sessions closed for that long.
/// Per-session topic counts are capped separately by `sessions.max_topics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConf {
    pub max_age_secs: u64,
    pub interval_secs: u64,
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self {
            max_age_secs: 24 * 3600,
            interval_secs: 300,
        }
    }
}

impl KernelConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}

/// Reads `$SPARKSCOPE_CONFIG` (default `sparkscope.yaml`); any problem falls back to defaults.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return KernelConfig::default();
        }
    };
    match KernelConfig::from_yaml(&text) {
        Ok(config) => {
            info!(path = %path.display(), "config loaded");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            KernelConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = KernelConfig::from_yaml(
            r#"
discovery:
  network_range: 10.10.0.0/24
  ports: [1883]
sparkplug:
  namespaces: [spBv1.0, ns]
bridge:
  auto_connect: false
"#,
        )
        .unwrap();
        assert_eq!(config.discovery.network_range.as_deref(), Some("10.10.0.0/24"));
        assert_eq!(config.discovery.ports, vec![1883]);
        assert_eq!(config.discovery.probe_timeout_ms, 5000);
        assert_eq!(config.sparkplug.namespaces, vec!["spBv1.0", "ns"]);
        assert_eq!(config.sparkplug.history_capacity, 1000);
        assert!(!config.bridge.auto_connect);
        assert_eq!(config.sessions.buffer_capacity, 1000);
        assert_eq!(config.health.interval_secs, 30);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(KernelConfig::from_yaml("  \n").unwrap(), KernelConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_or_missing_file_falls_back() {
        let missing = std::env::temp_dir().join(format!("sparkscope-missing-{}.yaml", uuid::Uuid::new_v4()));
        assert_eq!(load_config_from(&missing).await, KernelConfig::default());

        let invalid = std::env::temp_dir().join(format!("sparkscope-invalid-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&invalid, "discovery: [not, a, map]").unwrap();
        assert_eq!(load_config_from(&invalid).await, KernelConfig::default());
        std::fs::remove_file(&invalid).ok();
    }
}
