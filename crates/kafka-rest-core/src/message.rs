//! Message and membership types for the Kafka REST gateway
//!
//! Defines the broker membership model shared by the watcher and the
//! gateway, and the access-log record that flows down the log path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, Result};

/// A single broker endpoint in `host:port` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerAddress(String);

impl BrokerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrokerAddress {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

/// Broker registration record as stored under `<root>/brokers/ids/<id>`
///
/// Brokers write more fields than these; only `host` and `port` are read.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerRecord {
    pub host: String,
    pub port: u16,
}

impl BrokerRecord {
    /// Decode a record from the raw node value
    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn address(&self) -> BrokerAddress {
        BrokerAddress::new(&self.host, self.port)
    }
}

/// Ordered, complete set of brokers produced by one resolve
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerSet(Vec<BrokerAddress>);

impl BrokerSet {
    /// Build a set, rejecting duplicates and empty input
    pub fn new(addresses: Vec<BrokerAddress>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(GatewayError::discovery("broker set is empty"));
        }
        for (i, addr) in addresses.iter().enumerate() {
            if addresses[..i].contains(addr) {
                return Err(GatewayError::discovery(format!(
                    "duplicate broker address {}",
                    addr
                )));
            }
        }
        Ok(Self(addresses))
    }

    /// Parse a comma-separated `host:port` list
    pub fn parse_list(list: &str) -> Result<Self> {
        let addresses = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(BrokerAddress::from)
            .collect();
        Self::new(addresses)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrokerAddress> {
        self.0.iter()
    }

    /// Comma-joined form used for `bootstrap.servers`
    pub fn bootstrap_servers(&self) -> String {
        self.0
            .iter()
            .map(BrokerAddress::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for BrokerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.bootstrap_servers())
    }
}

/// Broker-assigned coordinates of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

impl RecordPosition {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }

    /// Opaque identifier handed back to HTTP callers
    pub fn identifier(&self) -> String {
        format!("important/{}/{}", self.partition, self.offset)
    }
}

/// One completed HTTP request, as published to the access-log topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub method: String,
    pub host: String,
    pub path: String,
    /// Remote peer address
    #[serde(rename = "ip")]
    pub remote_addr: String,
    /// Handler time in seconds
    #[serde(rename = "response_time")]
    pub response_time_seconds: f64,
}

impl AccessLogEntry {
    /// Serialize to the bytes handed to the log producer
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| GatewayError::serialization_with_source("access log entry", e))
    }
}

/// Output of the broker change watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A fresh resolve after a watch fire or a reconnect
    MembershipChanged(BrokerSet),
    /// The coordination session expired
    SessionLost,
    /// A new coordination session is established
    SessionRestored,
}

impl WatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MembershipChanged(_) => "membership_changed",
            Self::SessionLost => "session_lost",
            Self::SessionRestored => "session_restored",
        }
    }
}
