//! Configuration types for the Kafka REST gateway
//!
//! Uses the `config` crate for layered configuration from files and environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Root configuration for the gateway process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Coordination service (ZooKeeper) configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Kafka producer configuration
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Debug/admin API configuration
    #[serde(default)]
    pub admin: AdminApiConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// HTTP Server
// ============================================================================

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind and advertise
    #[serde(default = "default_listen_addr")]
    pub listen: String,

    /// Grace period for in-flight requests on shutdown and on producer swap
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            drain_timeout: default_drain_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ============================================================================
// Coordination Service
// ============================================================================

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// `host:port[,host:port...][/root]`; empty disables discovery
    #[serde(default)]
    pub address: String,

    /// Session timeout
    #[serde(with = "humantime_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,

    /// Advertise this gateway under `<root>/<namespace>/id`
    #[serde(default)]
    pub register: bool,

    /// Registration namespace, relative to the root
    #[serde(default = "default_registration_namespace")]
    pub registration_namespace: String,

    /// Reconnect backoff after session loss
    #[serde(default)]
    pub reconnect: RetryConfig,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_registration_namespace() -> String {
    "kafka-rest/producers".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            session_timeout: default_session_timeout(),
            register: false,
            registration_namespace: default_registration_namespace(),
            reconnect: RetryConfig::default(),
        }
    }
}

/// Parsed coordination address: server list plus root namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationAddress {
    /// Comma-separated `host:port` list
    pub servers: String,
    /// Root namespace, `""` for the top of the tree, otherwise `/a/b`
    pub root: String,
}

impl CoordinationAddress {
    /// Split `zk1:2181,zk2:2181/kafka` at the first `/`
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let (servers, root) = match address.find('/') {
            Some(idx) => (&address[..idx], &address[idx..]),
            None => (address, ""),
        };

        if servers.split(',').all(|s| s.trim().is_empty()) {
            return Err(GatewayError::config(format!(
                "coordination address {:?} has no servers",
                address
            )));
        }

        Ok(Self {
            servers: servers.to_string(),
            root: root.trim_end_matches('/').to_string(),
        })
    }

    /// Absolute path of a node under the root
    pub fn path(&self, relative: &str) -> String {
        format!("{}/{}", self.root, relative.trim_matches('/'))
    }

    /// `<root>/brokers/ids`
    pub fn broker_ids_path(&self) -> String {
        self.path("brokers/ids")
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, 0 for unlimited
    #[serde(default)]
    pub max_attempts: u32,

    /// Initial backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Maximum backoff delay
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

// ============================================================================
// Producers
// ============================================================================

/// Kafka producer configuration shared by both paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Retries on the data path before a send fails
    #[serde(default = "default_retry_connecting")]
    pub retry_connecting: u32,

    /// Topic for access-log entries
    #[serde(default = "default_log_topic")]
    pub log_topic: String,

    /// Log path flush frequency
    #[serde(with = "humantime_serde", default = "default_flush_frequency")]
    pub flush_frequency: Duration,

    /// Log path flush size threshold, in messages
    #[serde(default = "default_flush_messages")]
    pub flush_messages: usize,

    /// Log path send-queue capacity, in messages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout for the startup session probe against the brokers
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Upper bound on one data-path delivery, retries included
    #[serde(with = "humantime_serde", default = "default_message_timeout")]
    pub message_timeout: Duration,

    /// Enable client library debug logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_retry_connecting() -> u32 {
    10
}

fn default_log_topic() -> String {
    "kafka_producer_access_log".to_string()
}

fn default_flush_frequency() -> Duration {
    Duration::from_millis(500)
}

fn default_flush_messages() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    100_000
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_message_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            retry_connecting: default_retry_connecting(),
            log_topic: default_log_topic(),
            flush_frequency: default_flush_frequency(),
            flush_messages: default_flush_messages(),
            queue_capacity: default_queue_capacity(),
            connect_timeout: default_connect_timeout(),
            message_timeout: default_message_timeout(),
            verbose: false,
        }
    }
}

// ============================================================================
// Admin and Observability
// ============================================================================

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApiConfig {
    /// Enable admin API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

fn default_true() -> bool {
    true
}

fn default_admin_listen() -> String {
    "127.0.0.1:6060".to_string()
}

impl Default for AdminApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl GatewayConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix KAFKA_REST__
        builder = builder.add_source(
            config::Environment::with_prefix("KAFKA_REST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Coordination address, if discovery is enabled
    pub fn coordination_address(&self) -> Result<Option<CoordinationAddress>> {
        if self.coordination.address.trim().is_empty() {
            return Ok(None);
        }
        CoordinationAddress::parse(&self.coordination.address).map(Some)
    }
}
