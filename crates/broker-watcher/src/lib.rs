//! # Broker Watcher
//!
//! Discovers Kafka broker membership through ZooKeeper and watches it for
//! changes.
//!
//! ## Components
//!
//! - `BrokerResolver`: one-shot resolve of `<root>/brokers/ids`
//! - `BrokerWatcher`: re-arming watch loop with session recovery
//! - `register_gateway`: ephemeral self-registration
//! - `ZkCoordination`: `zookeeper-client` adapter
//! - `MockCoordination`: in-memory client for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! let zk = Arc::new(ZkCoordination::connect(&address.servers, timeout).await?);
//! let brokers = BrokerResolver::new(zk.clone(), &address).resolve().await?;
//!
//! let mut watcher = BrokerWatcher::new(zk, &address, RetryPolicy::default()).spawn(cancel);
//! while let Some(event) = watcher.next_event().await {
//!     // feed MembershipChanged into the gateway
//! }
//! ```

pub mod mock;
pub mod registration;
pub mod resolver;
pub mod watcher;
pub mod zookeeper;

pub use mock::*;
pub use registration::*;
pub use resolver::*;
pub use watcher::*;
pub use zookeeper::*;
