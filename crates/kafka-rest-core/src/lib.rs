//! # Kafka REST Core
//!
//! Core types, strategy traits, and configuration for the Kafka REST gateway.
//!
//! This crate defines the seams between the gateway and its collaborators:
//! - Broker membership (`BrokerSet`, `WatchEvent`)
//! - Coordination service access (`CoordinationClient`)
//! - The two producer capabilities (`DataProducer`, `LogProducer`)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  WatchEvent   ┌──────────────┐  restart   ┌──────────────┐
//! │ Coordination │──────────────►│   Broker     │───────────►│   Gateway    │
//! │   Client     │               │   Watcher    │            │ ProducerPair │
//! └──────────────┘               └──────────────┘            └──────┬───────┘
//!                                                                   │
//!                                                     ┌─────────────┴─────────┐
//!                                                     │ DataProducer (sync)   │
//!                                                     │ LogProducer  (async)  │
//!                                                     └───────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod retry;
pub mod strategy;

pub use self::config::*;
pub use self::error::*;
pub use self::message::*;
pub use self::metrics::*;
pub use self::retry::*;
pub use self::strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{CoordinationAddress, GatewayConfig, ProducerConfig};
    pub use crate::error::{GatewayError, Result};
    pub use crate::message::{
        AccessLogEntry, BrokerAddress, BrokerRecord, BrokerSet, RecordPosition, WatchEvent,
    };
    pub use crate::strategy::{
        ChildWatch, CoordinationClient, CreateMode, CreateOutcome, DataProducer, LogProducer,
        OpenedLogProducer, ProducerFactory, WatchFire,
    };
}
