//! Producer pair: one synchronous data producer and one asynchronous log
//! producer, both bound to the same broker set.
//!
//! A pair is immutable once opened. Membership changes build a new pair;
//! the old one is closed after its in-flight requests drain.

use bytes::Bytes;
use kafka_rest_core::prelude::*;
use kafka_rest_core::ProducerMetrics;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Producers bound to one `BrokerSet`
pub struct ProducerPair {
    id: u64,
    brokers: BrokerSet,
    data: Box<dyn DataProducer>,
    log: Box<dyn LogProducer>,
    in_flight: TaskTracker,
    drain_cancel: CancellationToken,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    delivery_failures: Arc<AtomicU64>,
    closed: AtomicBool,
    metrics: ProducerMetrics,
}

impl ProducerPair {
    /// Open both producers against `brokers`
    ///
    /// If the log producer fails to start, the already opened data producer
    /// is closed before the error is returned.
    pub async fn open(
        id: u64,
        factory: &dyn ProducerFactory,
        brokers: BrokerSet,
        config: &ProducerConfig,
    ) -> Result<Self> {
        let data = factory.open_data(&brokers, config).await?;

        let OpenedLogProducer { producer: log, failures } =
            match factory.open_log(&brokers, config).await {
                Ok(opened) => opened,
                Err(e) => {
                    if let Err(close_err) = data.close().await {
                        warn!(error = %close_err, "Failed to close data producer after log producer start failure");
                    }
                    return Err(e);
                }
            };

        let metrics = ProducerMetrics::new("producer_pair");
        let drain_cancel = CancellationToken::new();
        let delivery_failures = Arc::new(AtomicU64::new(0));
        let drain_task = tokio::spawn(drain_failures(
            id,
            failures,
            drain_cancel.clone(),
            delivery_failures.clone(),
            metrics.clone(),
        ));

        info!(pair = id, brokers = %brokers, "Producer pair opened");

        Ok(Self {
            id,
            brokers,
            data,
            log,
            in_flight: TaskTracker::new(),
            drain_cancel,
            drain_task: Mutex::new(Some(drain_task)),
            delivery_failures,
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The broker set both producers are bound to
    pub fn brokers(&self) -> &BrokerSet {
        &self.brokers
    }

    /// Synchronous, acknowledged send on the data path
    pub async fn send_data(&self, topic: &str, payload: Bytes) -> Result<RecordPosition> {
        if topic.is_empty() {
            self.metrics.record_publish_failed("empty_topic");
            return Err(GatewayError::publish("topic name is empty"));
        }

        self.data.send(topic, payload).await.map_err(|e| {
            self.metrics.record_publish_failed(e.kind());
            e
        })
    }

    /// Enqueue a serialized access-log entry on the log path
    ///
    /// Waits only for room in the log producer's bounded queue.
    pub async fn send_log_entry(&self, topic: &str, entry: Bytes) -> Result<()> {
        let start = Instant::now();
        let result = self.log.enqueue(topic, entry).await;
        self.metrics.record_enqueue_latency(start.elapsed());
        result
    }

    /// Delivery failures reported by the log producer so far
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Whether the delivery-failure drain task is still running
    pub fn drain_active(&self) -> bool {
        self.drain_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register an in-flight user of this pair
    pub(crate) fn track(&self) -> TaskTrackerToken {
        self.in_flight.token()
    }

    /// No longer admitting new users
    pub fn is_retiring(&self) -> bool {
        self.in_flight.is_closed()
    }

    /// Stop admitting users and wait up to `grace` for current ones
    pub async fn drain(&self, grace: Duration) {
        self.in_flight.close();
        if tokio::time::timeout(grace, self.in_flight.wait()).await.is_err() {
            warn!(
                pair = self.id,
                in_flight = self.in_flight.len(),
                grace_ms = grace.as_millis() as u64,
                "In-flight requests still running after grace period"
            );
        }
    }

    /// Close both producers, then stop the drain task
    ///
    /// Close failures are logged, never returned. Calling twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.data.close().await {
            error!(pair = self.id, error = %e, "Kafka producer failed to shut down data collector cleanly");
        }
        if let Err(e) = self.log.close().await {
            error!(pair = self.id, error = %e, "Kafka producer failed to shut down access log producer cleanly");
        }

        self.drain_cancel.cancel();
        let task = self
            .drain_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(pair = self.id, error = %e, "Delivery failure drain task panicked");
            }
        }

        info!(
            pair = self.id,
            brokers = %self.brokers,
            delivery_failures = self.delivery_failures(),
            "Producer pair closed"
        );
    }
}

/// Log every delivery failure until the pair is closed
async fn drain_failures(
    pair: u64,
    mut failures: mpsc::Receiver<GatewayError>,
    cancel: CancellationToken,
    counter: Arc<AtomicU64>,
    metrics: ProducerMetrics,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            failure = failures.recv() => match failure {
                Some(e) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    metrics.record_delivery_failed();
                    error!(pair, error = %e, "Failed to write access log entry");
                }
                None => {
                    // producer side is gone; keep the task alive until close
                    cancel.cancelled().await;
                    break;
                }
            },
        }
    }

    // report whatever was queued before close
    while let Ok(e) = failures.try_recv() {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics.record_delivery_failed();
        error!(pair, error = %e, "Failed to write access log entry");
    }
    debug!(pair, "Delivery failure drain stopped");
}

/// A pair captured for the lifetime of one request
///
/// Holding a lease keeps the pair from being closed until the lease is
/// dropped or the drain grace period runs out.
pub struct PairLease {
    pair: Arc<ProducerPair>,
    _token: TaskTrackerToken,
}

impl PairLease {
    pub(crate) fn new(pair: Arc<ProducerPair>, token: TaskTrackerToken) -> Self {
        Self { pair, _token: token }
    }

    pub fn pair(&self) -> &Arc<ProducerPair> {
        &self.pair
    }
}

impl Deref for PairLease {
    type Target = ProducerPair;

    fn deref(&self) -> &Self::Target {
        &self.pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProducerFactory;

    fn brokers(list: &str) -> BrokerSet {
        BrokerSet::parse_list(list).unwrap()
    }

    #[tokio::test]
    async fn test_open_binds_both_producers_to_the_same_set() {
        let factory = FakeProducerFactory::new();
        let pair = ProducerPair::open(1, &factory, brokers("a:1,b:2"), &ProducerConfig::default())
            .await
            .unwrap();

        assert_eq!(factory.opened_data(), vec![brokers("a:1,b:2")]);
        assert_eq!(factory.opened_log(), vec![brokers("a:1,b:2")]);
        assert_eq!(pair.brokers(), &brokers("a:1,b:2"));
        pair.close().await;
    }

    #[tokio::test]
    async fn test_open_failure_closes_data_producer() {
        let factory = FakeProducerFactory::new();
        factory.fail_log_opens(true);

        let result =
            ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default()).await;
        assert!(matches!(result, Err(GatewayError::ProducerStart { .. })));
        assert_eq!(factory.closed_data(), vec![brokers("a:1")]);
    }

    #[tokio::test]
    async fn test_send_data_rejects_empty_topic() {
        let factory = FakeProducerFactory::new();
        let pair = ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default())
            .await
            .unwrap();

        let err = pair.send_data("", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Publish { .. }));
        assert!(factory.data_sends().is_empty());
        pair.close().await;
    }

    #[tokio::test]
    async fn test_send_data_surfaces_producer_error() {
        let factory = FakeProducerFactory::new();
        factory.fail_data_sends("kafka: client has run out of available brokers");
        let pair = ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default())
            .await
            .unwrap();

        let err = pair
            .send_data("orders", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("run out of available brokers"));
        pair.close().await;
    }

    #[tokio::test]
    async fn test_drain_task_runs_until_close() {
        let factory = FakeProducerFactory::new();
        let pair = ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default())
            .await
            .unwrap();

        factory.inject_delivery_failure("log", "message timed out").await;
        factory.inject_delivery_failure("log", "message timed out").await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while pair.delivery_failures() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pair.delivery_failures(), 2);
        assert!(pair.drain_active());

        // the producer dropping its sender does not stop the drain
        factory.drop_failure_senders();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pair.drain_active());

        pair.close().await;
        assert!(!pair.drain_active());
        assert!(pair.is_closed());
        assert_eq!(factory.closed_log(), vec![brokers("a:1")]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = FakeProducerFactory::new();
        let pair = ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default())
            .await
            .unwrap();

        pair.close().await;
        pair.close().await;
        assert_eq!(factory.closed_data().len(), 1);
        assert_eq!(factory.closed_log().len(), 1);
    }

    #[tokio::test]
    async fn test_close_failures_are_not_propagated() {
        let factory = FakeProducerFactory::new();
        factory.fail_closes(true);
        let pair = ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default())
            .await
            .unwrap();

        pair.close().await;
        assert!(pair.is_closed());
        assert!(!pair.drain_active());
    }

    #[tokio::test]
    async fn test_drain_waits_for_leases() {
        let factory = FakeProducerFactory::new();
        let pair = Arc::new(
            ProducerPair::open(1, &factory, brokers("a:1"), &ProducerConfig::default())
                .await
                .unwrap(),
        );

        let token = pair.track();
        let lease = PairLease::new(pair.clone(), token);

        let drain = tokio::spawn({
            let pair = pair.clone();
            async move { pair.drain(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());
        assert!(pair.is_retiring());

        drop(lease);
        drain.await.unwrap();
        pair.close().await;
    }
}
