//! Metrics for the Kafka REST gateway
//!
//! Emitted through the `metrics` facade; the binary decides on an exporter.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names as constants for consistency
pub mod names {
    // Watcher metrics
    pub const WATCHER_REGISTRATIONS_TOTAL: &str = "broker_watcher_registrations_total";
    pub const WATCHER_FIRES_TOTAL: &str = "broker_watcher_fires_total";
    pub const WATCHER_RESOLVES_TOTAL: &str = "broker_watcher_resolves_total";
    pub const WATCHER_SESSION_LOST_TOTAL: &str = "broker_watcher_session_lost_total";
    pub const WATCHER_BROKERS: &str = "broker_watcher_brokers";

    // Gateway metrics
    pub const GATEWAY_REQUESTS_TOTAL: &str = "kafka_rest_requests_total";
    pub const GATEWAY_REQUEST_LATENCY: &str = "kafka_rest_request_latency_seconds";
    pub const GATEWAY_RESTARTS_TOTAL: &str = "kafka_rest_restarts_total";
    pub const GATEWAY_BOUND_BROKERS: &str = "kafka_rest_bound_brokers";

    // Producer metrics
    pub const PRODUCER_PUBLISH_FAILED: &str = "kafka_rest_publish_failed_total";
    pub const PRODUCER_DELIVERY_FAILED: &str = "kafka_rest_delivery_failed_total";
    pub const PRODUCER_ENQUEUE_LATENCY: &str = "kafka_rest_log_enqueue_latency_seconds";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const STATUS: &str = "status";
    pub const OUTCOME: &str = "outcome";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Watcher metrics
#[derive(Clone)]
pub struct WatcherMetrics {
    component: String,
}

impl WatcherMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a watch registration
    pub fn record_registration(&self) {
        counter!(
            names::WATCHER_REGISTRATIONS_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record a watch fire
    pub fn record_fire(&self) {
        counter!(
            names::WATCHER_FIRES_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record a resolve, successful or not
    pub fn record_resolve(&self, outcome: &'static str) {
        counter!(
            names::WATCHER_RESOLVES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    pub fn record_session_lost(&self) {
        counter!(
            names::WATCHER_SESSION_LOST_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    pub fn set_brokers(&self, count: usize) {
        gauge!(
            names::WATCHER_BROKERS,
            labels::COMPONENT => self.component.clone(),
        )
        .set(count as f64);
    }
}

/// Gateway metrics
#[derive(Clone)]
pub struct GatewayMetrics {
    component: String,
}

impl GatewayMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a completed request
    pub fn record_request(&self, status: u16, duration: Duration) {
        counter!(
            names::GATEWAY_REQUESTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
        histogram!(
            names::GATEWAY_REQUEST_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record a restart attempt
    pub fn record_restart(&self, outcome: &'static str) {
        counter!(
            names::GATEWAY_RESTARTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    pub fn set_bound_brokers(&self, count: usize) {
        gauge!(
            names::GATEWAY_BOUND_BROKERS,
            labels::COMPONENT => self.component.clone(),
        )
        .set(count as f64);
    }
}

/// Producer pair metrics
#[derive(Clone)]
pub struct ProducerMetrics {
    component: String,
}

impl ProducerMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_publish_failed(&self, error_type: &'static str) {
        counter!(
            names::PRODUCER_PUBLISH_FAILED,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type,
        )
        .increment(1);
    }

    pub fn record_delivery_failed(&self) {
        counter!(
            names::PRODUCER_DELIVERY_FAILED,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    pub fn record_enqueue_latency(&self, duration: Duration) {
        histogram!(
            names::PRODUCER_ENQUEUE_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}
