//! Node and executor configuration

use std::time::Duration;

use super::error::{DistributionError, DistributionResult};
use crate::store::SessionConfig;
use crate::utils::retry::RetryConfig;

pub const DEFAULT_GROUP: &str = "default";

/// Configuration for a distribution [`Node`](super::Node)
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Distribution group, nodes only see members of their own group
    pub group: String,

    /// Bound for session creation, registration and self-discovery
    pub startup_timeout: Duration,

    /// Bound for the explicit unregistration on shutdown
    pub shutdown_timeout: Duration,

    /// Batching window for change events, zero delivers every event immediately
    pub events_group_interval: Duration,

    /// Lease TTL of the registration record
    pub session_ttl: Duration,

    /// Deadline for one lease grant
    pub session_grant_timeout: Duration,

    /// Wait for the node's own record to appear, `None` skips the check
    pub self_discovery_timeout: Option<Duration>,

    /// Undelivered batches per listener before it is evicted
    pub listener_buffer: usize,

    /// Retries of the registration write
    pub registration_retry: RetryConfig,

    /// Backoff of the session keep-alive loop
    pub session_retry: RetryConfig,

    /// Backoff of the membership watch
    pub watch_retry: RetryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            events_group_interval: Duration::from_secs(5),
            session_ttl: Duration::from_secs(15),
            session_grant_timeout: Duration::from_secs(5),
            self_discovery_timeout: Some(Duration::from_secs(60)),
            listener_buffer: 64,
            registration_retry: RetryConfig::with_delays(3, 100, 2_000),
            session_retry: RetryConfig::background(),
            watch_retry: RetryConfig::background(),
        }
    }
}

impl NodeConfig {
    /// Create a new config builder
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Store prefix holding the registration records of the group
    pub fn nodes_prefix(&self) -> String {
        format!("runtime/distribution/group/{}/nodes/", self.group)
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl: self.session_ttl,
            grant_timeout: self.session_grant_timeout,
            retry: self.session_retry.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> DistributionResult<()> {
        if self.group.is_empty() || self.group.contains('/') {
            return Err(DistributionError::invalid_config(
                "group",
                "must be a non-empty name without '/'",
            ));
        }

        for (field, value) in [
            ("startup_timeout", self.startup_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("session_ttl", self.session_ttl),
            ("session_grant_timeout", self.session_grant_timeout),
        ] {
            if value.is_zero() {
                return Err(DistributionError::invalid_config(field, "must be greater than zero"));
            }
        }

        if self.session_ttl < Duration::from_secs(1) {
            return Err(DistributionError::invalid_config(
                "session_ttl",
                "must be at least one second",
            ));
        }

        if self.self_discovery_timeout.is_some_and(|t| t.is_zero()) {
            return Err(DistributionError::invalid_config(
                "self_discovery_timeout",
                "must be greater than zero, use None to disable",
            ));
        }

        if self.listener_buffer == 0 {
            return Err(DistributionError::invalid_config(
                "listener_buffer",
                "must hold at least one batch",
            ));
        }

        Ok(())
    }
}

/// Builder for NodeConfig
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    group: Option<String>,
    startup_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    events_group_interval: Option<Duration>,
    session_ttl: Option<Duration>,
    session_grant_timeout: Option<Duration>,
    self_discovery_timeout: Option<Option<Duration>>,
    listener_buffer: Option<usize>,
    registration_retry: Option<RetryConfig>,
    session_retry: Option<RetryConfig>,
    watch_retry: Option<RetryConfig>,
}

impl NodeConfigBuilder {
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn events_group_interval(mut self, interval: Duration) -> Self {
        self.events_group_interval = Some(interval);
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn session_grant_timeout(mut self, timeout: Duration) -> Self {
        self.session_grant_timeout = Some(timeout);
        self
    }

    pub fn self_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.self_discovery_timeout = Some(Some(timeout));
        self
    }

    /// Skip waiting for the node's own registration
    pub fn disable_self_discovery(mut self) -> Self {
        self.self_discovery_timeout = Some(None);
        self
    }

    pub fn listener_buffer(mut self, batches: usize) -> Self {
        self.listener_buffer = Some(batches);
        self
    }

    pub fn registration_retry(mut self, retry: RetryConfig) -> Self {
        self.registration_retry = Some(retry);
        self
    }

    pub fn session_retry(mut self, retry: RetryConfig) -> Self {
        self.session_retry = Some(retry);
        self
    }

    pub fn watch_retry(mut self, retry: RetryConfig) -> Self {
        self.watch_retry = Some(retry);
        self
    }

    /// Build the config
    pub fn build(self) -> DistributionResult<NodeConfig> {
        let defaults = NodeConfig::default();
        let config = NodeConfig {
            group: self.group.unwrap_or(defaults.group),
            startup_timeout: self.startup_timeout.unwrap_or(defaults.startup_timeout),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(defaults.shutdown_timeout),
            events_group_interval: self
                .events_group_interval
                .unwrap_or(defaults.events_group_interval),
            session_ttl: self.session_ttl.unwrap_or(defaults.session_ttl),
            session_grant_timeout: self
                .session_grant_timeout
                .unwrap_or(defaults.session_grant_timeout),
            self_discovery_timeout: self
                .self_discovery_timeout
                .unwrap_or(defaults.self_discovery_timeout),
            listener_buffer: self.listener_buffer.unwrap_or(defaults.listener_buffer),
            registration_retry: self
                .registration_retry
                .unwrap_or(defaults.registration_retry),
            session_retry: self.session_retry.unwrap_or(defaults.session_retry),
            watch_retry: self.watch_retry.unwrap_or(defaults.watch_retry),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration for an executor or work supervisor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Periodic reset, restarts the callback even without membership changes
    pub reset_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            reset_interval: Duration::from_secs(300),
        }
    }
}

impl ExecutorConfig {
    pub fn with_reset_interval(mut self, interval: Duration) -> Self {
        self.reset_interval = interval;
        self
    }

    pub fn validate(&self) -> DistributionResult<()> {
        if self.reset_interval.is_zero() {
            return Err(DistributionError::invalid_config(
                "reset_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.group, "default");
        assert_eq!(config.startup_timeout, Duration::from_secs(60));
        assert_eq!(config.session_ttl, Duration::from_secs(15));
        assert_eq!(config.self_discovery_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::builder()
            .group("storage")
            .events_group_interval(Duration::ZERO)
            .session_ttl(Duration::from_secs(3))
            .disable_self_discovery()
            .build()
            .unwrap();

        assert_eq!(config.group, "storage");
        assert_eq!(config.events_group_interval, Duration::ZERO);
        assert_eq!(config.self_discovery_timeout, None);
        assert_eq!(
            config.nodes_prefix(),
            "runtime/distribution/group/storage/nodes/"
        );
    }

    #[test]
    fn test_config_validation_fails() {
        assert!(NodeConfig::builder().group("a/b").build().is_err());
        assert!(NodeConfig::builder().group("").build().is_err());
        assert!(NodeConfig::builder()
            .startup_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(NodeConfig::builder()
            .session_ttl(Duration::from_millis(500))
            .build()
            .is_err());
        assert!(NodeConfig::builder().listener_buffer(0).build().is_err());
        assert!(NodeConfig::builder()
            .self_discovery_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_executor_config() {
        let config = ExecutorConfig::default();
        assert_eq!(config.reset_interval, Duration::from_secs(300));
        assert!(config.validate().is_ok());
        assert!(ExecutorConfig::default()
            .with_reset_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
