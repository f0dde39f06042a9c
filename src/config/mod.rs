//! Configuration management for fleetdist
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files, and converts it into the runtime configuration
//! of [`Node`](crate::distribution::Node) and its supervisors.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::distribution::{DistributionError, ExecutorConfig, NodeConfig};
use crate::store::EtcdConfig;

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<DistributionError> for ConfigError {
    fn from(err: DistributionError) -> Self {
        match err {
            DistributionError::InvalidConfig { field, reason } => Self::InvalidValue { field, reason },
            other => Self::invalid("node", other.to_string()),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node membership configuration
    pub node: NodeSettings,

    /// Lease session configuration
    pub session: SessionSettings,

    /// Supervisor configuration
    pub executor: ExecutorSettings,

    /// Coordination store connection
    pub store: StoreSettings,

    /// Status API configuration
    pub server: ServerSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Node ID, generated when not set
    pub node_id: Option<String>,

    /// Distribution group
    pub group: String,

    /// Startup timeout in seconds
    pub startup_timeout_secs: u64,

    /// Unregistration timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// Event batching window in milliseconds, 0 delivers immediately
    pub events_group_interval_ms: u64,

    /// Self-discovery timeout in seconds, 0 disables the check
    pub self_discovery_timeout_secs: u64,

    /// Undelivered event batches per listener
    pub listener_buffer: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            group: String::from("default"),
            startup_timeout_secs: 60,
            shutdown_timeout_secs: 5,
            events_group_interval_ms: 5_000,
            self_discovery_timeout_secs: 60,
            listener_buffer: 64,
        }
    }
}

/// Lease session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Lease TTL in seconds
    pub ttl_secs: u64,

    /// Grant timeout in seconds
    pub grant_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 15,
            grant_timeout_secs: 5,
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Periodic reset interval in seconds
    pub reset_interval_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            reset_interval_secs: 300,
        }
    }
}

/// Coordination store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// etcd endpoints
    pub endpoints: Vec<String>,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![String::from("http://127.0.0.1:2379")],
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address of the status API
    pub bind_address: String,

    /// Enable CORS for the API
    pub enable_cors: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1:8080"),
            enable_cors: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {name}: {value}")),
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, dropping empty items
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from `FLEETDIST_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let node = NodeSettings {
            node_id: std::env::var("FLEETDIST_NODE_ID").ok(),
            group: std::env::var("FLEETDIST_GROUP").unwrap_or(defaults.node.group),
            startup_timeout_secs: env_or(
                "FLEETDIST_STARTUP_TIMEOUT",
                defaults.node.startup_timeout_secs,
            )?,
            shutdown_timeout_secs: env_or(
                "FLEETDIST_SHUTDOWN_TIMEOUT",
                defaults.node.shutdown_timeout_secs,
            )?,
            events_group_interval_ms: env_or(
                "FLEETDIST_EVENTS_GROUP_INTERVAL_MS",
                defaults.node.events_group_interval_ms,
            )?,
            self_discovery_timeout_secs: env_or(
                "FLEETDIST_SELF_DISCOVERY_TIMEOUT",
                defaults.node.self_discovery_timeout_secs,
            )?,
            listener_buffer: env_or("FLEETDIST_LISTENER_BUFFER", defaults.node.listener_buffer)?,
        };

        let session = SessionSettings {
            ttl_secs: env_or("FLEETDIST_SESSION_TTL", defaults.session.ttl_secs)?,
            grant_timeout_secs: env_or(
                "FLEETDIST_SESSION_GRANT_TIMEOUT",
                defaults.session.grant_timeout_secs,
            )?,
        };

        let executor = ExecutorSettings {
            reset_interval_secs: env_or(
                "FLEETDIST_RESET_INTERVAL",
                defaults.executor.reset_interval_secs,
            )?,
        };

        let store = StoreSettings {
            endpoints: match std::env::var("FLEETDIST_ETCD_ENDPOINTS") {
                Ok(value) => split_list(&value),
                Err(_) => defaults.store.endpoints,
            },
            connect_timeout_secs: env_or(
                "FLEETDIST_ETCD_CONNECT_TIMEOUT",
                defaults.store.connect_timeout_secs,
            )?,
            request_timeout_secs: env_or(
                "FLEETDIST_ETCD_REQUEST_TIMEOUT",
                defaults.store.request_timeout_secs,
            )?,
        };

        let server = ServerSettings {
            bind_address: std::env::var("FLEETDIST_BIND_ADDRESS")
                .unwrap_or(defaults.server.bind_address),
            enable_cors: env_or("FLEETDIST_ENABLE_CORS", defaults.server.enable_cors)?,
        };

        let logging = LoggingConfig {
            level: std::env::var("FLEETDIST_LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: std::env::var("FLEETDIST_LOG_FORMAT").unwrap_or(defaults.logging.format),
        };

        Ok(Self {
            node,
            session,
            executor,
            store,
            server,
            logging,
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if let Some(node_id) = &self.node.node_id {
            if node_id.is_empty() || node_id.contains('/') {
                return Err(ConfigError::invalid(
                    "node.node_id",
                    "must be a non-empty name without '/'",
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::invalid(
                "logging.format",
                format!("unknown format '{}', expected text or json", self.logging.format),
            ));
        }

        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "server.bind_address",
                format!("invalid address '{}'", self.server.bind_address),
            ));
        }

        if self.store.endpoints.is_empty() {
            return Err(ConfigError::invalid(
                "store.endpoints",
                "at least one endpoint is required",
            ));
        }
        if self.store.connect_timeout_secs == 0 || self.store.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "store",
                "timeouts must be greater than zero",
            ));
        }

        self.node_config()?;
        self.executor_config().validate()?;
        Ok(())
    }

    /// Configured node ID, or a generated one
    pub fn node_id(&self) -> String {
        self.node.node_id.clone().unwrap_or_else(|| {
            let id = Uuid::new_v4().simple().to_string();
            format!("node-{}", &id[..8])
        })
    }

    /// Runtime configuration of the node
    pub fn node_config(&self) -> std::result::Result<NodeConfig, ConfigError> {
        let mut builder = NodeConfig::builder()
            .group(self.node.group.clone())
            .startup_timeout(Duration::from_secs(self.node.startup_timeout_secs))
            .shutdown_timeout(Duration::from_secs(self.node.shutdown_timeout_secs))
            .events_group_interval(Duration::from_millis(self.node.events_group_interval_ms))
            .session_ttl(Duration::from_secs(self.session.ttl_secs))
            .session_grant_timeout(Duration::from_secs(self.session.grant_timeout_secs))
            .listener_buffer(self.node.listener_buffer);

        builder = match self.node.self_discovery_timeout_secs {
            0 => builder.disable_self_discovery(),
            secs => builder.self_discovery_timeout(Duration::from_secs(secs)),
        };

        Ok(builder.build()?)
    }

    /// Connection settings of the etcd store
    pub fn etcd_config(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.store.endpoints.clone(),
            connect_timeout: Duration::from_secs(self.store.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.store.request_timeout_secs),
        }
    }

    /// Runtime configuration of supervisors
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_reset_interval(Duration::from_secs(self.executor.reset_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: &[&str] = &[
        "FLEETDIST_NODE_ID",
        "FLEETDIST_GROUP",
        "FLEETDIST_STARTUP_TIMEOUT",
        "FLEETDIST_SELF_DISCOVERY_TIMEOUT",
        "FLEETDIST_SESSION_TTL",
        "FLEETDIST_RESET_INTERVAL",
        "FLEETDIST_LOG_FORMAT",
        "FLEETDIST_ETCD_ENDPOINTS",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let node = config.node_config().unwrap();
        assert_eq!(node.group, "default");
        assert_eq!(node.session_ttl, Duration::from_secs(15));
        assert_eq!(node.self_discovery_timeout, Some(Duration::from_secs(60)));
        assert_eq!(
            config.executor_config().reset_interval,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.node.group = "a/b".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "group"
        ));

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.executor.reset_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.endpoints.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "store.endpoints"
        ));
    }

    #[test]
    #[serial]
    fn test_etcd_endpoints_from_env() {
        clear_env();
        std::env::set_var(
            "FLEETDIST_ETCD_ENDPOINTS",
            "http://etcd-0:2379, http://etcd-1:2379,,",
        );

        let config = Config::from_env().unwrap();
        clear_env();

        let etcd = config.etcd_config();
        assert_eq!(etcd.endpoints, vec!["http://etcd-0:2379", "http://etcd-1:2379"]);
        assert_eq!(etcd.connect_timeout, Duration::from_secs(5));
        assert_eq!(etcd.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_self_discovery_disabled_with_zero() {
        let mut config = Config::default();
        config.node.self_discovery_timeout_secs = 0;
        assert_eq!(config.node_config().unwrap().self_discovery_timeout, None);
    }

    #[test]
    fn test_generated_node_id() {
        let config = Config::default();
        let first = config.node_id();
        assert!(first.starts_with("node-"));
        assert_ne!(first, config.node_id());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("FLEETDIST_NODE_ID", "worker-1");
        std::env::set_var("FLEETDIST_GROUP", "storage");
        std::env::set_var("FLEETDIST_SESSION_TTL", "30");
        std::env::set_var("FLEETDIST_RESET_INTERVAL", "60");

        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.node_id(), "worker-1");
        assert_eq!(config.node.group, "storage");
        assert_eq!(config.session.ttl_secs, 30);
        assert_eq!(config.executor.reset_interval_secs, 60);
        assert_eq!(config.node.startup_timeout_secs, 60);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        clear_env();
        std::env::set_var("FLEETDIST_STARTUP_TIMEOUT", "soon");

        let result = Config::from_env();
        clear_env();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("FLEETDIST_STARTUP_TIMEOUT"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = "worker-7"
group = "indexers"
events_group_interval_ms = 0

[session]
ttl_secs = 9

[store]
endpoints = ["http://10.0.0.5:2379"]

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.node_id.as_deref(), Some("worker-7"));
        assert_eq!(config.node.group, "indexers");
        assert_eq!(config.session.ttl_secs, 9);
        assert_eq!(config.session.grant_timeout_secs, 5);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.etcd_config().endpoints, vec!["http://10.0.0.5:2379"]);

        let node = config.node_config().unwrap();
        assert_eq!(node.events_group_interval, Duration::ZERO);
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/fleetdist.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
