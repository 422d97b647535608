//! In-memory producer factory
//!
//! Records every producer it opens, every record it accepts and every close,
//! keyed by the broker set the producer was bound to. Sends, opens and
//! closes can be made to fail, and either path can be held open to observe
//! in-flight behaviour.

use async_trait::async_trait;
use bytes::Bytes;
use kafka_rest_core::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

/// Record accepted by a fake producer: `(bound set, topic, payload)`
pub type Accepted = (BrokerSet, String, Bytes);

#[derive(Default)]
struct FakeState {
    opened_data: Vec<BrokerSet>,
    opened_log: Vec<BrokerSet>,
    closed_data: Vec<BrokerSet>,
    closed_log: Vec<BrokerSet>,
    data_sends: Vec<Accepted>,
    log_entries: Vec<Accepted>,
    fail_data_opens: bool,
    fail_log_opens: bool,
    fail_closes: bool,
    data_error: Option<String>,
    fixed_position: Option<RecordPosition>,
    next_offset: i64,
    failure_senders: Vec<mpsc::Sender<GatewayError>>,
}

struct Shared {
    state: Mutex<FakeState>,
    data_open: watch::Sender<bool>,
    log_open: watch::Sender<bool>,
    data_started: watch::Sender<usize>,
    log_started: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer factory fake
#[derive(Clone)]
pub struct FakeProducerFactory {
    shared: Arc<Shared>,
}

impl Default for FakeProducerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProducerFactory {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FakeState::default()),
                data_open: watch::channel(true).0,
                log_open: watch::channel(true).0,
                data_started: watch::channel(0).0,
                log_started: watch::channel(0).0,
            }),
        }
    }

    // --- behaviour ---

    pub fn fail_data_opens(&self, fail: bool) {
        self.shared.lock().fail_data_opens = fail;
    }

    pub fn fail_log_opens(&self, fail: bool) {
        self.shared.lock().fail_log_opens = fail;
    }

    pub fn fail_closes(&self, fail: bool) {
        self.shared.lock().fail_closes = fail;
    }

    /// Make every data send fail with `message`
    pub fn fail_data_sends(&self, message: &str) {
        self.shared.lock().data_error = Some(message.to_string());
    }

    /// Answer every data send with the same position
    pub fn respond_with(&self, partition: i32, offset: i64) {
        self.shared.lock().fixed_position = Some(RecordPosition::new(partition, offset));
    }

    /// Hold data sends until `release_data_sends`
    pub fn gate_data_sends(&self) {
        self.shared.data_open.send_replace(false);
    }

    pub fn release_data_sends(&self) {
        self.shared.data_open.send_replace(true);
    }

    /// Hold log enqueues, as a full log queue would
    pub fn stall_log(&self) {
        self.shared.log_open.send_replace(false);
    }

    pub fn release_log(&self) {
        self.shared.log_open.send_replace(true);
    }

    /// Report a delivery failure on the most recently opened log producer
    pub async fn inject_delivery_failure(&self, topic: &str, message: &str) {
        let sender = self.shared.lock().failure_senders.last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(GatewayError::delivery(topic, message)).await;
        }
    }

    /// Drop every failure sender this factory still holds
    pub fn drop_failure_senders(&self) {
        self.shared.lock().failure_senders.clear();
    }

    // --- observation ---

    pub fn opened_data(&self) -> Vec<BrokerSet> {
        self.shared.lock().opened_data.clone()
    }

    pub fn opened_log(&self) -> Vec<BrokerSet> {
        self.shared.lock().opened_log.clone()
    }

    pub fn closed_data(&self) -> Vec<BrokerSet> {
        self.shared.lock().closed_data.clone()
    }

    pub fn closed_log(&self) -> Vec<BrokerSet> {
        self.shared.lock().closed_log.clone()
    }

    /// Completed data sends
    pub fn data_sends(&self) -> Vec<Accepted> {
        self.shared.lock().data_sends.clone()
    }

    /// Completed log enqueues
    pub fn log_entries(&self) -> Vec<Accepted> {
        self.shared.lock().log_entries.clone()
    }

    /// Wait until `count` data sends have started (gated or not)
    pub async fn wait_for_data_sends(&self, count: usize) {
        let mut rx = self.shared.data_started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }

    /// Wait until `count` log enqueues have started
    pub async fn wait_for_log_enqueues(&self, count: usize) {
        let mut rx = self.shared.log_started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }

    /// Wait until `count` log entries have been accepted
    pub async fn wait_for_log_entries(&self, count: usize) {
        while self.shared.lock().log_entries.len() < count {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ProducerFactory for FakeProducerFactory {
    async fn open_data(
        &self,
        brokers: &BrokerSet,
        _config: &ProducerConfig,
    ) -> Result<Box<dyn DataProducer>> {
        let mut state = self.shared.lock();
        if state.fail_data_opens {
            return Err(GatewayError::producer_start(format!(
                "kafka: client has run out of available brokers to talk to {}",
                brokers
            )));
        }
        state.opened_data.push(brokers.clone());
        Ok(Box::new(FakeDataProducer {
            brokers: brokers.clone(),
            shared: self.shared.clone(),
        }))
    }

    async fn open_log(
        &self,
        brokers: &BrokerSet,
        _config: &ProducerConfig,
    ) -> Result<OpenedLogProducer> {
        let mut state = self.shared.lock();
        if state.fail_log_opens {
            return Err(GatewayError::producer_start(format!(
                "kafka: client has run out of available brokers to talk to {}",
                brokers
            )));
        }
        state.opened_log.push(brokers.clone());

        let (tx, rx) = mpsc::channel(16);
        state.failure_senders.push(tx);
        Ok(OpenedLogProducer {
            producer: Box::new(FakeLogProducer {
                brokers: brokers.clone(),
                shared: self.shared.clone(),
            }),
            failures: rx,
        })
    }
}

struct FakeDataProducer {
    brokers: BrokerSet,
    shared: Arc<Shared>,
}

#[async_trait]
impl DataProducer for FakeDataProducer {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<RecordPosition> {
        self.shared.data_started.send_modify(|n| *n += 1);
        let mut open = self.shared.data_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let mut state = self.shared.lock();
        if let Some(message) = &state.data_error {
            return Err(GatewayError::publish(message.clone()));
        }
        state
            .data_sends
            .push((self.brokers.clone(), topic.to_string(), payload));

        let position = match state.fixed_position {
            Some(position) => position,
            None => {
                let offset = state.next_offset;
                state.next_offset += 1;
                RecordPosition::new(0, offset)
            }
        };
        Ok(position)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        state.closed_data.push(self.brokers.clone());
        if state.fail_closes {
            return Err(GatewayError::Internal("close failed".to_string()));
        }
        Ok(())
    }
}

struct FakeLogProducer {
    brokers: BrokerSet,
    shared: Arc<Shared>,
}

#[async_trait]
impl LogProducer for FakeLogProducer {
    async fn enqueue(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.shared.log_started.send_modify(|n| *n += 1);
        let mut open = self.shared.log_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        self.shared
            .lock()
            .log_entries
            .push((self.brokers.clone(), topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.lock();
        state.closed_log.push(self.brokers.clone());
        if state.fail_closes {
            return Err(GatewayError::Internal("close failed".to_string()));
        }
        Ok(())
    }
}
