//! # Configuration Module
//!
//! Configuration structures for the gateway and the loading pipeline:
//! YAML file -> environment overrides -> validation.
//!
//! ## Key Features
//! - YAML configuration parsing with serde (every section has defaults)
//! - Human-readable durations (`"10s"`, `"500ms"`) via `humantime-serde`
//! - Environment variable overrides (`GATEWAY_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// How backend nodes attach to the gateway
    pub nodes: NodeTransportConfig,

    /// Logging and metrics settings
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file if it exists, otherwise start from defaults
    ///
    /// Environment overrides and validation apply in both cases.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "Loading gateway configuration");
            return Self::load_from_file(path).await;
        }

        warn!(path = %path.display(), "Configuration file not found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without applying overrides
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_HTTP_PORT=8011
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("GATEWAY_SERVER_HTTP_PORT") {
            self.server.http_port = port.parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_HTTP_PORT: {}", e)))?;
        }

        if let Some(size) = lookup("GATEWAY_SERVER_MAX_REQUEST_SIZE") {
            self.server.max_request_size = size.parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_MAX_REQUEST_SIZE: {}", e)))?;
        }

        if let Some(grace) = lookup("GATEWAY_SERVER_SHUTDOWN_GRACE") {
            self.server.shutdown_grace = humantime::parse_duration(&grace)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_SHUTDOWN_GRACE: {}", e)))?;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        } else if self.server.socket_addr().is_err() {
            errors.push(format!(
                "bind_address '{}' with port {} is not a valid socket address",
                self.server.bind_address, self.server.http_port
            ));
        }

        if self.server.max_request_size == 0 {
            errors.push("max_request_size must be greater than 0".to_string());
        }

        if !self.nodes.connect_path.starts_with('/') {
            errors.push(format!("nodes.connect_path must start with '/', got: {}", self.nodes.connect_path));
        }

        if self.nodes.event_buffer == 0 {
            errors.push("nodes.event_buffer must be greater than 0".to_string());
        }

        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => errors.push(format!("Invalid log level: {}", self.observability.logging.level)),
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {},
            _ => errors.push(format!("Invalid log format: {}", self.observability.logging.format)),
        }

        let metrics = &self.observability.metrics;
        if metrics.prometheus_enabled && !metrics.endpoint_path.starts_with('/') {
            errors.push(format!("metrics.endpoint_path must start with '/', got: {}", metrics.endpoint_path));
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// HTTP port serving `/server_calls` and the node attachment endpoint
    pub http_port: u16,

    /// Maximum request body size in bytes
    pub max_request_size: usize,

    /// How long in-flight requests may keep running after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> GatewayResult<SocketAddr> {
        format!("{}:{}", self.bind_address, self.http_port)
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid bind address: {}", e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8011,
            max_request_size: 2 * 1024 * 1024, // 2MB
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Node attachment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTransportConfig {
    /// WebSocket path nodes connect to
    pub connect_path: String,

    /// Capacity of the registry's life-cycle event channel
    pub event_buffer: usize,
}

impl Default for NodeTransportConfig {
    fn default() -> Self {
        Self {
            connect_path: "/nodes/connect".to_string(),
            event_buffer: 1024,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and expose it over HTTP
    pub prometheus_enabled: bool,

    /// Metrics endpoint path
    pub endpoint_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            endpoint_path: "/metrics".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.socket_addr().unwrap().port(), 8011);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = GatewayConfig::from_yaml(
            "server:\n  http_port: 9000\n  shutdown_grace: 3s\nobservability:\n  logging:\n    format: json\n",
        )
        .unwrap();

        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.server.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.observability.logging.format, "json");
        assert_eq!(config.observability.logging.level, "info");
        assert_eq!(config.nodes.connect_path, "/nodes/connect");
    }

    #[test]
    fn test_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("GATEWAY_SERVER_HTTP_PORT", "9100"),
            ("GATEWAY_SERVER_BIND_ADDRESS", "127.0.0.1"),
            ("GATEWAY_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.http_port, 9100);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.observability.logging.level, "debug");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = GatewayConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "GATEWAY_SERVER_HTTP_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = GatewayConfig::default();
        config.server.max_request_size = 0;
        config.nodes.connect_path = "nodes".to_string();
        config.observability.logging.level = "loud".to_string();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_request_size"));
        assert!(message.contains("connect_path"));
        assert!(message.contains("Invalid log level: loud"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  bind_address: 127.0.0.1\n  http_port: 8123").unwrap();

        let config = GatewayConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.server.socket_addr().unwrap(), "127.0.0.1:8123".parse().unwrap());
    }

    #[tokio::test]
    async fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load_or_default(dir.path().join("missing.yaml")).await.unwrap();
        assert_eq!(config.nodes, NodeTransportConfig::default());
    }
}
