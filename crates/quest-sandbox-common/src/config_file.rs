//! Configuration file structures for quest-sandbox.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`HostConfigFile`]: Settings for the in-process host
//! - [`AiConfig`]: Where `ai.ask` prompts are forwarded

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = false
///
/// [runtime.execution]
/// max_fuel = 1_000_000_000
///
/// [runtime.sandbox]
/// source_context_lines = 10
///
/// [host]
/// start_url = "https://example.com"
///
/// [host.ai]
/// endpoint = "https://llm.example.com/v1/ask"
/// allowed_hosts = ["llm.example.com"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution and sandbox settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Host configuration.
    #[serde(default)]
    pub host: HostConfigFile,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// In-process host configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfigFile {
    /// URL reported by `quest.getCurrentUrl` before any navigation.
    #[serde(default = "defaults::start_url")]
    pub start_url: String,

    /// Forwarding settings for `ai.ask`.
    #[serde(default)]
    pub ai: AiConfig,
}

impl Default for HostConfigFile {
    fn default() -> Self {
        Self {
            start_url: defaults::start_url(),
            ai: AiConfig::default(),
        }
    }
}

/// Forwarding settings for `ai.ask`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AiConfig {
    /// Endpoint receiving `POST {"prompt", "instanceId"}`.
    ///
    /// When unset, `ai.ask` is not registered and guests get
    /// `Error: unknown capability`.
    pub endpoint: Option<String>,

    /// Hosts the forwarder may contact.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Request timeout in seconds.
    #[serde(default = "defaults::ai_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum prompts forwarded per host lifetime.
    #[serde(default = "defaults::ai_max_requests")]
    pub max_requests: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            allowed_hosts: Vec::new(),
            timeout_secs: defaults::ai_timeout_secs(),
            max_requests: defaults::ai_max_requests(),
        }
    }
}

impl AiConfig {
    /// Check if forwarding is properly configured.
    ///
    /// Returns `true` if an endpoint and at least one allowed host are set.
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && !self.allowed_hosts.is_empty()
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn start_url() -> String {
        "about:blank".to_string()
    }

    pub const fn ai_timeout_secs() -> u64 {
        30
    }

    pub const fn ai_max_requests() -> u32 {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.host.start_url, "about:blank");
        assert!(config.host.ai.endpoint.is_none());
        assert!(config.host.ai.allowed_hosts.is_empty());
        assert_eq!(config.host.ai.timeout_secs, 30);
        assert_eq!(config.host.ai.max_requests, 100);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [host]
            start_url = "https://example.com"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.host.start_url, "https://example.com");
        assert_eq!(config.host.ai.timeout_secs, 30);
        assert_eq!(config.runtime.sandbox.source_context_lines, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            pooling_allocator = true
            max_instances = 8

            [runtime.execution]
            max_fuel = 5_000_000
            fuel_metering = false

            [runtime.sandbox]
            blob_origin = "frame-7"
            default_code = "noop"
            source_context_lines = 4

            [host]
            start_url = "https://start.example.com"

            [host.ai]
            endpoint = "https://llm.example.com/ask"
            allowed_hosts = ["llm.example.com"]
            timeout_secs = 5
            max_requests = 3
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(config.runtime.engine.pooling_allocator);
        assert_eq!(config.runtime.engine.max_instances, 8);
        assert_eq!(config.runtime.execution.max_fuel, 5_000_000);
        assert!(!config.runtime.execution.fuel_metering);
        assert_eq!(config.runtime.sandbox.blob_origin, "frame-7");
        assert_eq!(config.runtime.sandbox.default_code, "noop");
        assert_eq!(config.runtime.sandbox.source_context_lines, 4);
        assert_eq!(config.host.start_url, "https://start.example.com");
        assert_eq!(
            config.host.ai.endpoint.as_deref(),
            Some("https://llm.example.com/ask")
        );
        assert_eq!(config.host.ai.allowed_hosts, vec!["llm.example.com"]);
        assert_eq!(config.host.ai.timeout_secs, 5);
        assert_eq!(config.host.ai.max_requests, 3);
    }

    #[test]
    fn test_ai_config_is_configured() {
        let mut ai = AiConfig::default();
        assert!(!ai.is_configured());

        ai.endpoint = Some("https://llm.example.com/ask".to_string());
        assert!(!ai.is_configured());

        ai.allowed_hosts.push("llm.example.com".to_string());
        assert!(ai.is_configured());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
