//! Error types for the Kafka REST gateway
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Primary error type for all gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Coordination service read or broker record decode failure
    #[error("Discovery error: {message}")]
    Discovery {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A producer could not establish its session against the broker set
    #[error("Producer start error: {message}")]
    ProducerStart {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Data-path send failed after the producer's own retries
    #[error("{message}")]
    Publish {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Log-path delivery failed after the producer's own retries
    #[error("Delivery error on topic {topic}: {message}")]
    Delivery { topic: String, message: String },

    /// Coordination service session lost or unusable
    #[error("Session error: {message}")]
    Session {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// HTTP server failure after bind
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Graceful shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a discovery error
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
            source: None,
        }
    }

    /// Create a discovery error with source
    pub fn discovery_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Discovery {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a producer start error
    pub fn producer_start(message: impl Into<String>) -> Self {
        Self::ProducerStart {
            message: message.into(),
            source: None,
        }
    }

    /// Create a producer start error with source
    pub fn producer_start_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ProducerStart {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a publish error
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
            source: None,
        }
    }

    /// Create a publish error with source
    pub fn publish_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Publish {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a delivery error
    pub fn delivery(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
            source: None,
        }
    }

    /// Create a session error with source
    pub fn session_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Session {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error with source
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if the coordination session must be re-established
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::Session { .. })
    }

    /// Short machine-friendly name used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery",
            Self::ProducerStart { .. } => "producer_start",
            Self::Publish { .. } => "publish",
            Self::Delivery { .. } => "delivery",
            Self::Session { .. } => "session",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::Bind { .. } => "bind",
            Self::Http(_) => "http",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub topic: Option<String>,
    pub brokers: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref topic) = self.topic {
            write!(f, " topic={}", topic)?;
        }
        if let Some(ref brokers) = self.brokers {
            write!(f, " brokers={}", brokers)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                topic = ?ctx.topic,
                brokers = ?ctx.brokers,
                "Operation failed"
            );
            e
        })
    }
}
