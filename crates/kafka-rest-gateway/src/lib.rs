//! # Kafka REST Gateway
//!
//! HTTP to Kafka gateway. Every request body is published synchronously to
//! the topic named by the last path segment, and every request is recorded
//! asynchronously on an access-log topic.
//!
//! ## Hot restart
//!
//! The current producer pair lives in a single atomic slot. Each request
//! captures the pair once and uses it for both its send and its access-log
//! entry. A membership change opens a fresh pair, swaps it in, then closes
//! the old one once its in-flight requests have finished. A pair that
//! fails to open leaves the running one untouched.
//!
//! ## Deployment Modes
//!
//! **ZooKeeper discovery:**
//! ```bash
//! kafka-rest-gateway --zookeeper zk1:2181,zk2:2181/kafka
//! ```
//!
//! **Static brokers (no watcher):**
//! ```bash
//! kafka-rest-gateway --brokers kafka0:9092,kafka1:9092
//! ```

pub mod admin_api;
pub mod kafka;
pub mod producer;
pub mod server;
pub mod testing;

pub use admin_api::*;
pub use kafka::*;
pub use producer::*;
pub use server::*;

use arc_swap::ArcSwap;
use broker_watcher::WatcherHandle;
use kafka_rest_core::prelude::*;
use kafka_rest_core::{ErrorContext, ErrorContextExt, GatewayMetrics};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Gateway lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum GatewayState {
    Starting = 0,
    Serving = 1,
    Restarting = 2,
    Closed = 3,
}

impl GatewayState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Serving,
            2 => Self::Restarting,
            _ => Self::Closed,
        }
    }
}

/// Runtime options for a gateway instance
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub producer: ProducerConfig,
    /// Grace period for in-flight requests on a retiring pair
    pub drain_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for GatewayOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            producer: config.producer.clone(),
            drain_timeout: config.server.drain_timeout,
            max_body_bytes: config.server.max_body_bytes,
        }
    }
}

/// HTTP to Kafka gateway
pub struct Gateway {
    factory: Arc<dyn ProducerFactory>,
    options: GatewayOptions,
    current: ArcSwap<ProducerPair>,
    state: AtomicU8,
    // serializes restarts and close
    lifecycle: Mutex<()>,
    next_pair: AtomicU64,
    metrics: GatewayMetrics,
    requests: AtomicU64,
    failed_requests: AtomicU64,
    restarts: AtomicU64,
    failed_restarts: AtomicU64,
}

impl Gateway {
    /// Open the initial producer pair
    ///
    /// Fails if the pair cannot be opened against `brokers`.
    pub async fn start(
        factory: Arc<dyn ProducerFactory>,
        brokers: BrokerSet,
        options: GatewayOptions,
    ) -> Result<Self> {
        let pair = ProducerPair::open(0, factory.as_ref(), brokers.clone(), &options.producer)
            .await
            .with_context(ErrorContext {
                component: "gateway",
                operation: "start".to_string(),
                topic: None,
                brokers: Some(brokers.to_string()),
            })?;

        let metrics = GatewayMetrics::new("kafka_rest_gateway");
        metrics.set_bound_brokers(brokers.len());

        Ok(Self {
            factory,
            options,
            current: ArcSwap::from_pointee(pair),
            state: AtomicU8::new(GatewayState::Starting as u8),
            lifecycle: Mutex::new(()),
            next_pair: AtomicU64::new(1),
            metrics,
            requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            failed_restarts: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> GatewayState {
        GatewayState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: GatewayState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Called once the listener is accepting connections
    pub fn mark_serving(&self) {
        let _ = self.state.compare_exchange(
            GatewayState::Starting as u8,
            GatewayState::Serving as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    pub fn log_topic(&self) -> &str {
        &self.options.producer.log_topic
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// The pair new requests are given
    pub fn current(&self) -> Arc<ProducerPair> {
        self.current.load_full()
    }

    /// Brokers the current pair is bound to
    pub fn brokers(&self) -> BrokerSet {
        self.current.load().brokers().clone()
    }

    /// Capture the current pair for one request
    pub fn lease(&self) -> PairLease {
        loop {
            let pair = self.current.load_full();
            // token first, so a concurrent drain either sees it or we see the drain
            let token = pair.track();
            if !pair.is_retiring() || self.state() == GatewayState::Closed {
                return PairLease::new(pair, token);
            }
            // lost the race with a swap; the slot already holds the new pair
            std::hint::spin_loop();
        }
    }

    /// Record the outcome of one request
    pub fn record_request(&self, status: u16, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.record_request(status, elapsed);
    }

    /// Move to a new producer pair bound to `brokers`
    ///
    /// On failure the current pair keeps serving and the error is returned.
    pub async fn restart(&self, brokers: BrokerSet) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == GatewayState::Closed {
            return Err(GatewayError::Shutdown);
        }

        let previous = self.state();
        self.set_state(GatewayState::Restarting);
        let id = self.next_pair.fetch_add(1, Ordering::Relaxed);
        info!(pair = id, brokers = %brokers, "Restarting producers");

        let opened = ProducerPair::open(id, self.factory.as_ref(), brokers.clone(), &self.options.producer)
            .await
            .with_context(ErrorContext {
                component: "gateway",
                operation: "restart".to_string(),
                topic: None,
                brokers: Some(brokers.to_string()),
            });

        let pair = match opened {
            Ok(pair) => Arc::new(pair),
            Err(e) => {
                self.failed_restarts.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_restart("failed");
                self.set_state(previous);
                warn!(current = %self.current.load().brokers(), "Keeping current producers");
                return Err(e);
            }
        };

        let old = self.current.swap(pair);
        self.set_state(previous);
        self.restarts.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_restart("ok");
        self.metrics.set_bound_brokers(brokers.len());
        info!(pair = id, retired = old.id(), "Producers swapped");

        self.retire(old).await;
        Ok(())
    }

    /// Wait out in-flight users of `pair`, then close it
    async fn retire(&self, pair: Arc<ProducerPair>) {
        pair.drain(self.options.drain_timeout).await;
        pair.close().await;
    }

    /// Close the current pair; later restarts are refused
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == GatewayState::Closed {
            return;
        }
        self.set_state(GatewayState::Closed);
        info!("Closing gateway");
        self.retire(self.current.load_full()).await;
    }

    /// Feed watcher events into `restart` until cancelled
    ///
    /// A watcher that stops early leaves the gateway serving on its current
    /// pair; this still returns only once `cancel` fires.
    pub async fn follow_membership(&self, watcher: &mut WatcherHandle, cancel: &CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = watcher.next_event() => event,
            };

            match event {
                Some(WatchEvent::MembershipChanged(brokers)) => {
                    if let Err(e) = self.restart(brokers).await {
                        error!(error = %e, "Failed to restart producers");
                    }
                }
                Some(WatchEvent::SessionLost) => {
                    warn!("Coordination session lost, serving on current brokers");
                }
                Some(WatchEvent::SessionRestored) => {
                    info!("Coordination session restored");
                }
                None => {
                    warn!(brokers = %self.brokers(), "Broker watcher stopped, serving on current brokers");
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> GatewayStats {
        let pair = self.current.load();
        GatewayStats {
            state: self.state(),
            brokers: pair.brokers().iter().map(|b| b.to_string()).collect(),
            pair: pair.id(),
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            failed_restarts: self.failed_restarts.load(Ordering::Relaxed),
            delivery_failures: pair.delivery_failures(),
        }
    }
}

/// Gateway statistics
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub state: GatewayState,
    pub brokers: Vec<String>,
    pub pair: u64,
    pub requests: u64,
    pub failed_requests: u64,
    pub restarts: u64,
    pub failed_restarts: u64,
    /// Log-path failures reported on the current pair
    pub delivery_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProducerFactory;
    use bytes::Bytes;

    fn brokers(list: &str) -> BrokerSet {
        BrokerSet::parse_list(list).unwrap()
    }

    fn options() -> GatewayOptions {
        GatewayOptions {
            drain_timeout: Duration::from_secs(5),
            ..GatewayOptions::default()
        }
    }

    async fn gateway(factory: &FakeProducerFactory) -> Arc<Gateway> {
        let gateway = Gateway::start(Arc::new(factory.clone()), brokers("a:1"), options())
            .await
            .unwrap();
        gateway.mark_serving();
        Arc::new(gateway)
    }

    #[tokio::test]
    async fn test_start_fails_when_pair_cannot_open() {
        let factory = FakeProducerFactory::new();
        factory.fail_data_opens(true);

        let result = Gateway::start(Arc::new(factory), brokers("a:1"), options()).await;
        assert!(matches!(result, Err(GatewayError::ProducerStart { .. })));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let factory = FakeProducerFactory::new();
        let gateway = Gateway::start(Arc::new(factory.clone()), brokers("a:1"), options())
            .await
            .unwrap();
        assert_eq!(gateway.state(), GatewayState::Starting);

        gateway.mark_serving();
        assert_eq!(gateway.state(), GatewayState::Serving);

        gateway.restart(brokers("b:2")).await.unwrap();
        assert_eq!(gateway.state(), GatewayState::Serving);

        gateway.close().await;
        assert_eq!(gateway.state(), GatewayState::Closed);
        gateway.mark_serving();
        assert_eq!(gateway.state(), GatewayState::Closed);
    }

    #[tokio::test]
    async fn test_restart_swaps_and_closes_old_pair() {
        let factory = FakeProducerFactory::new();
        let gateway = gateway(&factory).await;
        let old = gateway.current();

        gateway.restart(brokers("b:2,c:3")).await.unwrap();

        assert_eq!(gateway.brokers(), brokers("b:2,c:3"));
        assert!(old.is_closed());
        assert!(!gateway.current().is_closed());
        assert_eq!(factory.closed_data(), vec![brokers("a:1")]);
        assert_eq!(factory.closed_log(), vec![brokers("a:1")]);
        assert_eq!(gateway.stats().restarts, 1);
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_current_pair() {
        let factory = FakeProducerFactory::new();
        let gateway = gateway(&factory).await;
        let before = gateway.current();

        factory.fail_log_opens(true);
        let err = gateway.restart(brokers("b:2")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ProducerStart { .. }));

        assert!(Arc::ptr_eq(&before, &gateway.current()));
        assert!(!before.is_closed());
        assert_eq!(gateway.state(), GatewayState::Serving);
        assert_eq!(gateway.stats().failed_restarts, 1);

        // the half-opened data producer for b:2 was closed, a:1 was not
        assert_eq!(factory.closed_data(), vec![brokers("b:2")]);

        let lease = gateway.lease();
        lease.send_data("orders", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(factory.data_sends()[0].0, brokers("a:1"));
    }

    #[tokio::test]
    async fn test_request_before_swap_completes_on_old_pair() {
        let factory = FakeProducerFactory::new();
        let gateway = gateway(&factory).await;
        factory.gate_data_sends();

        let lease = gateway.lease();
        let request = tokio::spawn(async move {
            let position = lease.send_data("orders", Bytes::from_static(b"x")).await;
            let log = lease
                .send_log_entry("log", Bytes::from_static(b"{}"))
                .await;
            (position, log)
        });
        factory.wait_for_data_sends(1).await;

        let restart = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.restart(brokers("b:2")).await }
        });

        // the swap happens, but the old pair stays open for the request
        while gateway.brokers() != brokers("b:2") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(factory.closed_data().is_empty());

        factory.release_data_sends();
        let (position, log) = request.await.unwrap();
        position.unwrap();
        log.unwrap();
        restart.await.unwrap().unwrap();

        assert_eq!(factory.data_sends()[0].0, brokers("a:1"));
        assert_eq!(factory.log_entries()[0].0, brokers("a:1"));
        assert_eq!(factory.closed_data(), vec![brokers("a:1")]);
    }

    #[tokio::test]
    async fn test_request_after_swap_uses_new_pair() {
        let factory = FakeProducerFactory::new();
        let gateway = gateway(&factory).await;

        gateway.restart(brokers("b:2")).await.unwrap();

        let lease = gateway.lease();
        lease.send_data("orders", Bytes::from_static(b"x")).await.unwrap();
        lease.send_log_entry("log", Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(factory.data_sends()[0].0, brokers("b:2"));
        assert_eq!(factory.log_entries()[0].0, brokers("b:2"));
    }

    #[tokio::test]
    async fn test_retire_gives_up_after_grace_period() {
        let factory = FakeProducerFactory::new();
        let gateway = Gateway::start(
            Arc::new(factory.clone()),
            brokers("a:1"),
            GatewayOptions {
                drain_timeout: Duration::from_millis(50),
                ..GatewayOptions::default()
            },
        )
        .await
        .unwrap();

        let _stuck = gateway.lease();
        gateway.restart(brokers("b:2")).await.unwrap();
        assert_eq!(factory.closed_data(), vec![brokers("a:1")]);
    }

    #[tokio::test]
    async fn test_restart_after_close_is_refused() {
        let factory = FakeProducerFactory::new();
        let gateway = gateway(&factory).await;

        gateway.close().await;
        assert!(matches!(
            gateway.restart(brokers("b:2")).await,
            Err(GatewayError::Shutdown)
        ));
        assert_eq!(factory.opened_data().len(), 1);
        assert!(gateway.current().is_closed());
    }

    #[tokio::test]
    async fn test_follow_membership_restarts_on_change() {
        use broker_watcher::{BrokerWatcher, MockCoordination};
        use kafka_rest_core::RetryPolicy;

        let zk = Arc::new(MockCoordination::new());
        zk.put_broker("/kafka", "0", "kafka0", 9092);
        let address = CoordinationAddress::parse("zk:2181/kafka").unwrap();

        let factory = FakeProducerFactory::new();
        let gateway = Arc::new(
            Gateway::start(
                Arc::new(factory.clone()),
                brokers("kafka0:9092"),
                options(),
            )
            .await
            .unwrap(),
        );
        gateway.mark_serving();

        let cancel = CancellationToken::new();
        let mut handle =
            BrokerWatcher::new(zk.clone(), &address, RetryPolicy::default()).spawn(cancel.clone());

        let follower = tokio::spawn({
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            async move {
                gateway.follow_membership(&mut handle, &cancel).await;
                handle
            }
        });

        zk.wait_for_registrations(1).await;
        zk.put_broker("/kafka", "1", "kafka1", 9092);

        let expected = brokers("kafka0:9092,kafka1:9092");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while gateway.brokers() != expected && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gateway.brokers(), expected);
        assert_eq!(factory.closed_data(), vec![brokers("kafka0:9092")]);

        cancel.cancel();
        let handle = follower.await.unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_watcher_giving_up_keeps_gateway_serving() {
        use broker_watcher::{BrokerWatcher, MockCoordination};
        use kafka_rest_core::RetryPolicy;

        let zk = Arc::new(MockCoordination::new());
        zk.put_broker("/kafka", "0", "kafka0", 9092);
        let address = CoordinationAddress::parse("zk:2181/kafka").unwrap();
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
        };

        let factory = FakeProducerFactory::new();
        let gateway = Arc::new(
            Gateway::start(Arc::new(factory.clone()), brokers("kafka0:9092"), options())
                .await
                .unwrap(),
        );
        gateway.mark_serving();

        let cancel = CancellationToken::new();
        let mut handle = BrokerWatcher::new(zk.clone(), &address, policy).spawn(CancellationToken::new());
        let follower = tokio::spawn({
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            async move { gateway.follow_membership(&mut handle, &cancel).await }
        });

        zk.wait_for_registrations(1).await;
        zk.fail_reconnects(10);
        zk.expire_session();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!follower.is_finished());
        assert_eq!(gateway.state(), GatewayState::Serving);
        let lease = gateway.lease();
        lease.send_data("orders", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(factory.data_sends()[0].0, brokers("kafka0:9092"));
        drop(lease);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .unwrap()
            .unwrap();
    }
}
