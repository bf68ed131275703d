//! YAML configuration surface, deserialized via `serde`/`serde_yml`.
//!
//! Validation here is shape-only (the document parses, types match); the
//! business-rule validation (CIDR syntax, port ranges, non-empty cipher
//! method/password) happens at `start_proxy`, not here.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hook::{FallbackBehavior, TrafficHookConfig};
use crate::plugin::{HandshakeConfig, ManagerConfig};

/// Environment variable that overrides `handshake.cookie-value` when set,
/// so the cookie never has to live in a config file on disk.
pub const COOKIE_VALUE_ENV: &str = "OPENWORLD_COOKIE_VALUE";
/// Environment variable that overrides `plugin-dir` for containerized deployments.
pub const PLUGIN_DIR_ENV: &str = "OPENWORLD_PLUGIN_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HandshakeSection {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            cookie_key: "DECODER_PLUGIN_COOKIE".to_string(),
            cookie_value: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ManagerSection {
    pub auto_load_plugins: Vec<String>,
    pub max_concurrent_plugins: usize,
    pub load_timeout_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            auto_load_plugins: Vec::new(),
            max_concurrent_plugins: 10,
            load_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrafficHookSection {
    pub enabled: bool,
    pub decoder_plugin: Option<String>,
    pub fallback_behavior: String,
    pub timeout_ms: u64,
    pub log_decode_errors: bool,
}

impl Default for TrafficHookSection {
    fn default() -> Self {
        Self {
            enabled: false,
            decoder_plugin: None,
            fallback_behavior: "pass".to_string(),
            timeout_ms: 5000,
            log_decode_errors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyDefaultsSection {
    pub traffic_hook: TrafficHookSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DebugSection {
    pub enabled: bool,
    pub default_plugin_name: Option<String>,
    pub test_data: Option<String>,
    pub verbose_logging: bool,
}

impl Default for DebugSection {
    fn default() -> Self {
        Self {
            enabled: false,
            default_plugin_name: None,
            test_data: None,
            verbose_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyDef {
    pub id: String,
    pub listen_addr: String,
    pub method: String,
    pub password: String,
    pub block_ips: Vec<String>,
    pub block_ports: Vec<String>,
    pub enabled: bool,
}

impl Default for ProxyDef {
    fn default() -> Self {
        Self {
            id: String::new(),
            listen_addr: "127.0.0.1:8388".to_string(),
            method: "aes-256-gcm".to_string(),
            password: String::new(),
            block_ips: Vec::new(),
            block_ports: Vec::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    pub handshake: HandshakeSection,
    pub plugin_dir: String,
    pub manager: ManagerSection,
    pub proxy: ProxyDefaultsSection,
    pub debug: DebugSection,
    pub proxies: Vec<ProxyDef>,
}

impl AppConfig {
    /// Parse from a YAML string; a missing/empty document still produces a
    /// runnable configuration (every section implements `Default`).
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig = if yaml.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::from_yaml(&contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(cookie) = std::env::var(COOKIE_VALUE_ENV) {
            self.handshake.cookie_value = cookie;
        }
        if let Ok(dir) = std::env::var(PLUGIN_DIR_ENV) {
            self.plugin_dir = dir;
        }
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            protocol_version: self.handshake.protocol_version,
            cookie_key: self.handshake.cookie_key.clone(),
            cookie_value: self.handshake.cookie_value.clone(),
            load_timeout: Duration::from_secs(self.manager.load_timeout_secs),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            handshake: self.handshake_config(),
            max_concurrent_plugins: self.manager.max_concurrent_plugins,
            auto_load_plugins: self.manager.auto_load_plugins.clone(),
        }
    }

    pub fn traffic_hook_config(&self) -> TrafficHookConfig {
        let section = &self.proxy.traffic_hook;
        TrafficHookConfig {
            enabled: section.enabled,
            decoder_plugin: section.decoder_plugin.clone(),
            fallback_behavior: FallbackBehavior::parse(&section.fallback_behavior),
            timeout: Duration::from_millis(section.timeout_ms),
            log_decode_errors: section.log_decode_errors,
            default_plugin_name: self.debug.default_plugin_name.clone(),
        }
    }
}
