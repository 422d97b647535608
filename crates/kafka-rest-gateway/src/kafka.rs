//! rdkafka-backed producers
//!
//! The data path uses a `FutureProducer` and waits for the leader's
//! acknowledgement. The log path uses a `ThreadedProducer` whose delivery
//! callback forwards failures onto the pair's failure channel.

use async_trait::async_trait;
use bytes::Bytes;
use kafka_rest_core::prelude::*;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{
    BaseRecord, DeliveryResult, FutureProducer, FutureRecord, Producer, ProducerContext,
    ThreadedProducer,
};
use rdkafka::util::Timeout;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the log path failure channel
const FAILURE_CHANNEL_CAPACITY: usize = 1024;

/// Pause before retrying an enqueue into a full log queue
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound on flushing a producer at close
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer factory backed by librdkafka
#[derive(Debug, Clone, Default)]
pub struct KafkaProducerFactory;

impl KafkaProducerFactory {
    pub fn new() -> Self {
        Self
    }

    fn base_config(brokers: &BrokerSet, config: &ProducerConfig) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", brokers.bootstrap_servers())
            .set("acks", "1")
            .set("message.send.max.retries", config.retry_connecting.to_string())
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            );
        if config.verbose {
            client.set("debug", "broker,topic,msg");
        }
        client
    }
}

/// Verify that every address in `brokers` answers as a broker
///
/// `fetch` reads metadata through the producer's own client, so a pair only
/// goes live once its session against the whole set is established.
async fn probe<F>(fetch: F, brokers: &BrokerSet) -> Result<()>
where
    F: FnOnce() -> KafkaResult<Metadata> + Send + 'static,
{
    let metadata = tokio::task::spawn_blocking(fetch)
        .await
        .map_err(|e| GatewayError::Internal(format!("metadata probe task: {}", e)))?
        .map_err(|e| {
            GatewayError::producer_start_with_source(
                format!("failed to fetch metadata from {}", brokers),
                e,
            )
        })?;

    let advertised: Vec<String> = metadata
        .brokers()
        .iter()
        .map(|b| format!("{}:{}", b.host(), b.port()))
        .collect();

    let missing = unmatched(brokers, &advertised).await;
    if !missing.is_empty() {
        return Err(GatewayError::producer_start(format!(
            "brokers not reachable: {}",
            missing.join(",")
        )));
    }

    debug!(brokers = %brokers, "Broker probe succeeded");
    Ok(())
}

/// Configured addresses with no counterpart among the advertised brokers
///
/// Matches by name first, then by resolved socket address, so an IP or
/// alias from a static list still matches the broker's advertised host.
async fn unmatched(brokers: &BrokerSet, advertised: &[String]) -> Vec<String> {
    let named: HashSet<&str> = advertised.iter().map(String::as_str).collect();
    let by_name: Vec<&BrokerAddress> = brokers
        .iter()
        .filter(|b| !named.contains(b.as_str()))
        .collect();
    if by_name.is_empty() {
        return Vec::new();
    }

    let mut resolved: HashSet<SocketAddr> = HashSet::new();
    for addr in advertised {
        match tokio::net::lookup_host(addr.as_str()).await {
            Ok(addrs) => resolved.extend(addrs),
            Err(e) => debug!(addr = %addr, error = %e, "Cannot resolve advertised broker"),
        }
    }

    let mut missing = Vec::new();
    for broker in by_name {
        let matched = match tokio::net::lookup_host(broker.as_str()).await {
            Ok(mut addrs) => addrs.any(|a| resolved.contains(&a)),
            Err(_) => false,
        };
        if !matched {
            missing.push(broker.to_string());
        }
    }
    missing
}

/// Run a blocking flush off the async workers
async fn flush<F>(op: F) -> Result<()>
where
    F: FnOnce() -> KafkaResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| GatewayError::Internal(format!("flush task: {}", e)))?
        .map_err(|e| GatewayError::Internal(format!("flush failed: {}", e)))
}

#[async_trait]
impl ProducerFactory for KafkaProducerFactory {
    async fn open_data(
        &self,
        brokers: &BrokerSet,
        config: &ProducerConfig,
    ) -> Result<Box<dyn DataProducer>> {
        let producer: FutureProducer = Self::base_config(brokers, config)
            .create()
            .map_err(|e| {
                GatewayError::producer_start_with_source("failed to create data producer", e)
            })?;
        let producer = Arc::new(producer);
        let client = producer.clone();
        let timeout = config.connect_timeout;
        probe(
            move || client.client().fetch_metadata(None, Timeout::After(timeout)),
            brokers,
        )
        .await?;

        info!(brokers = %brokers, "Data collector producer started");
        Ok(Box::new(KafkaDataProducer {
            producer,
            timeout: config.message_timeout,
        }))
    }

    async fn open_log(
        &self,
        brokers: &BrokerSet,
        config: &ProducerConfig,
    ) -> Result<OpenedLogProducer> {
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);

        let mut client = Self::base_config(brokers, config);
        client
            .set("compression.type", "none")
            .set(
                "queue.buffering.max.ms",
                config.flush_frequency.as_millis().to_string(),
            )
            .set("batch.num.messages", config.flush_messages.to_string())
            .set(
                "queue.buffering.max.messages",
                config.queue_capacity.to_string(),
            );

        let producer: ThreadedProducer<LogDeliveryContext> = client
            .create_with_context(LogDeliveryContext {
                failures: failures_tx,
            })
            .map_err(|e| {
                GatewayError::producer_start_with_source("failed to create access log producer", e)
            })?;
        let producer = Arc::new(producer);
        let client = producer.clone();
        let timeout = config.connect_timeout;
        probe(
            move || client.client().fetch_metadata(None, Timeout::After(timeout)),
            brokers,
        )
        .await?;

        info!(brokers = %brokers, "Access log producer started");
        Ok(OpenedLogProducer {
            producer: Box::new(KafkaLogProducer { producer }),
            failures: failures_rx,
        })
    }
}

/// Synchronous data path producer
pub struct KafkaDataProducer {
    producer: Arc<FutureProducer>,
    timeout: Duration,
}

#[async_trait]
impl DataProducer for KafkaDataProducer {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<RecordPosition> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload.as_ref());
        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|(partition, offset)| RecordPosition::new(partition, offset))
            .map_err(|(e, _message)| GatewayError::publish_with_source(e.to_string(), e))
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        flush(move || producer.flush(Timeout::After(CLOSE_FLUSH_TIMEOUT))).await
    }
}

/// Forwards log path delivery failures to the owning pair
pub struct LogDeliveryContext {
    failures: mpsc::Sender<GatewayError>,
}

impl ClientContext for LogDeliveryContext {}

impl ProducerContext for LogDeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        if let Err((e, message)) = result {
            let failure = GatewayError::delivery(message.topic(), e.to_string());
            if self.failures.try_send(failure).is_err() {
                warn!(topic = message.topic(), error = %e, "Delivery failure dropped, channel full");
            }
        }
    }
}

/// Asynchronous log path producer
pub struct KafkaLogProducer {
    producer: Arc<ThreadedProducer<LogDeliveryContext>>,
}

#[async_trait]
impl LogProducer for KafkaLogProducer {
    async fn enqueue(&self, topic: &str, payload: Bytes) -> Result<()> {
        loop {
            let record = BaseRecord::<(), [u8]>::to(topic).payload(payload.as_ref());
            match self.producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((e, _)) => return Err(GatewayError::delivery(topic, e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        flush(move || producer.flush(Timeout::After(CLOSE_FLUSH_TIMEOUT))).await
    }
}
