//! Strategy traits for the Kafka REST gateway
//!
//! The seams between the core and its external collaborators. Each trait
//! can be backed by a real client library or by an in-memory fake.
//!
//! ## Strategy Hierarchy
//!
//! ```text
//! CoordinationClient (membership reads, one-shot watches, registration)
//!     └── ZkCoordination, MockCoordination
//!
//! ProducerFactory (builds producers bound to one BrokerSet)
//!     ├── DataProducer  (synchronous, acknowledged)
//!     └── LogProducer   (asynchronous, buffered, failures on a channel)
//!         └── KafkaProducerFactory, FakeProducerFactory
//! ```

use crate::config::ProducerConfig;
use crate::error::{GatewayError, Result};
use crate::message::{BrokerSet, RecordPosition};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

// ============================================================================
// Coordination Service
// ============================================================================

/// What ended a one-shot children watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFire {
    /// The watched node's children (or the node itself) changed
    ChildrenChanged,
    /// The session that armed the watch is gone
    SessionExpired,
}

/// A registered one-shot watch; resolves exactly once
pub type ChildWatch = BoxFuture<'static, WatchFire>;

/// Node flavour for `create`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    EphemeralSequential,
}

/// Result of a `create` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Node created; carries the final path (with any sequence suffix)
    Created(String),
    AlreadyExists,
}

/// Hierarchical, watchable namespace client
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Child names of `path`, in the order the service lists them
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Raw value stored at `path`
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Arm a one-shot watch on the children of `path`
    ///
    /// The watch fires once. Callers must arm a new one to keep observing.
    async fn watch_children(&self, path: &str) -> Result<ChildWatch>;

    /// Create a node holding `data`
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<CreateOutcome>;

    /// Replace an expired session with a fresh one
    async fn reconnect(&self) -> Result<()>;

    /// Close the session; further calls fail
    async fn close(&self);
}

// ============================================================================
// Producers
// ============================================================================

/// Synchronous producer: `send` returns once the partition leader has the record
#[async_trait]
pub trait DataProducer: Send + Sync {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<RecordPosition>;

    async fn close(&self) -> Result<()>;
}

/// Asynchronous producer: `enqueue` only waits on the bounded send queue
///
/// Delivery failures surface on the channel handed out by the factory,
/// after the producer's own retries are exhausted.
#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn enqueue(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A log producer plus the receiving end of its delivery-failure channel
pub struct OpenedLogProducer {
    pub producer: Box<dyn LogProducer>,
    pub failures: mpsc::Receiver<GatewayError>,
}

/// Builds producers bound to one broker set
#[async_trait]
pub trait ProducerFactory: Send + Sync {
    async fn open_data(
        &self,
        brokers: &BrokerSet,
        config: &ProducerConfig,
    ) -> Result<Box<dyn DataProducer>>;

    async fn open_log(&self, brokers: &BrokerSet, config: &ProducerConfig)
        -> Result<OpenedLogProducer>;
}
