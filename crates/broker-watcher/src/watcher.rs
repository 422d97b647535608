//! Broker membership watch loop
//!
//! Arms a one-shot children watch on `<root>/brokers/ids`. After every fire
//! the next watch is armed before the re-resolve, so a change landing during
//! the resolve fires that watch instead of going unseen. Session expiry
//! moves the loop into reconnect with backoff; a restored session
//! re-creates the gateway registration and is always followed by a fresh
//! resolve.
//!
//! Events go out through a `tokio::sync::watch` slot, so a slow consumer
//! only ever sees the most recent pending event.

use kafka_rest_core::prelude::*;
use kafka_rest_core::{RetryPolicy, WatcherMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registration::register_gateway;
use crate::resolver::BrokerResolver;

/// Delay before re-arming after a non-session arm failure
const REARM_DELAY: Duration = Duration::from_millis(500);

/// Watch loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Not watching; terminal once the loop has exited
    Disconnected,
    /// Session up, a children watch is (being) armed
    Watching,
    /// Session expired, reconnecting
    SessionLost,
}

/// Ephemeral advertisement owned by the watch loop
#[derive(Debug, Clone)]
pub struct Registration {
    pub namespace: String,
    /// `host:port` stored in the node
    pub advertised: String,
}

/// Watches broker membership and emits `WatchEvent`s
pub struct BrokerWatcher {
    client: Arc<dyn CoordinationClient>,
    address: CoordinationAddress,
    resolver: BrokerResolver,
    reconnect: RetryPolicy,
    registration: Option<Registration>,
    metrics: WatcherMetrics,
}

impl BrokerWatcher {
    /// Create a watcher over an already connected client
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        address: &CoordinationAddress,
        reconnect: RetryPolicy,
    ) -> Self {
        Self {
            resolver: BrokerResolver::new(client.clone(), address),
            client,
            address: address.clone(),
            reconnect,
            registration: None,
            metrics: WatcherMetrics::new("broker_watcher"),
        }
    }

    /// Re-create `registration` whenever a lost session is restored
    ///
    /// The initial registration is the caller's; the node dies with the
    /// session, so only the loop knows when it must come back.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    /// Start the watch loop on its own task
    pub fn spawn(self, cancel: CancellationToken) -> WatcherHandle {
        let (events_tx, events_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(WatcherState::Disconnected);
        let cancel = cancel.child_token();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.run(events_tx, state_tx, cancel).await }
        });

        WatcherHandle {
            events: events_rx,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        events: watch::Sender<Option<WatchEvent>>,
        state: watch::Sender<WatcherState>,
        cancel: CancellationToken,
    ) {
        info!(path = %self.resolver.ids_path(), "Broker watcher started");

        let mut current = WatcherState::Watching;
        // set after a restore: membership may have changed while disconnected
        let mut resync = false;
        while current != WatcherState::Disconnected {
            state.send_replace(current);
            current = match current {
                WatcherState::Watching => {
                    self.watch(&events, &cancel, std::mem::take(&mut resync))
                        .await
                }
                WatcherState::SessionLost => {
                    let next = self.recover(&events, &cancel).await;
                    resync = next == WatcherState::Watching;
                    next
                }
                WatcherState::Disconnected => WatcherState::Disconnected,
            };
        }

        state.send_replace(WatcherState::Disconnected);
        info!("Broker watcher stopped");
    }

    /// Arm a children watch, retrying until armed
    ///
    /// `Err` carries the state to move to instead.
    async fn arm(&self, cancel: &CancellationToken) -> std::result::Result<ChildWatch, WatcherState> {
        loop {
            match self.client.watch_children(self.resolver.ids_path()).await {
                Ok(watch) => {
                    self.metrics.record_registration();
                    debug!(path = %self.resolver.ids_path(), "Broker watch armed");
                    return Ok(watch);
                }
                Err(e) if e.is_session_loss() => {
                    warn!(error = %e, "Session lost while arming broker watch");
                    return Err(WatcherState::SessionLost);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to arm broker watch, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WatcherState::Disconnected),
                        _ = tokio::time::sleep(REARM_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Watch until the session is lost or the loop is cancelled
    ///
    /// Exactly one watch is armed at a time.
    async fn watch(
        &self,
        events: &watch::Sender<Option<WatchEvent>>,
        cancel: &CancellationToken,
        resync: bool,
    ) -> WatcherState {
        let mut watch = match self.arm(cancel).await {
            Ok(watch) => watch,
            Err(next) => return next,
        };
        if resync {
            self.emit_membership(events).await;
        }

        loop {
            let fire = tokio::select! {
                _ = cancel.cancelled() => return WatcherState::Disconnected,
                fire = &mut watch => fire,
            };

            match fire {
                WatchFire::ChildrenChanged => {
                    self.metrics.record_fire();
                    watch = match self.arm(cancel).await {
                        Ok(watch) => watch,
                        Err(next) => return next,
                    };
                    self.emit_membership(events).await;
                }
                WatchFire::SessionExpired => return WatcherState::SessionLost,
            }
        }
    }

    /// Reconnect with backoff, then restore the registration
    async fn recover(
        &self,
        events: &watch::Sender<Option<WatchEvent>>,
        cancel: &CancellationToken,
    ) -> WatcherState {
        self.metrics.record_session_lost();
        warn!("Coordination session lost");
        events.send_replace(Some(WatchEvent::SessionLost));

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return WatcherState::Disconnected;
            }

            attempt += 1;
            match self.client.reconnect().await {
                Ok(()) => break,
                Err(e) if self.reconnect.should_retry(attempt) => {
                    let delay = self.reconnect.delay(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Reconnect failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return WatcherState::Disconnected,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, attempt, "Giving up on coordination session");
                    return WatcherState::Disconnected;
                }
            }
        }

        info!(attempt, "Coordination session restored");
        if let Some(registration) = &self.registration {
            if let Err(e) = register_gateway(
                self.client.as_ref(),
                &self.address,
                &registration.namespace,
                &registration.advertised,
            )
            .await
            {
                error!(error = %e, "Failed to re-register gateway");
            }
        }
        events.send_replace(Some(WatchEvent::SessionRestored));
        WatcherState::Watching
    }

    async fn emit_membership(&self, events: &watch::Sender<Option<WatchEvent>>) {
        match self.resolver.resolve().await {
            Ok(set) => {
                self.metrics.record_resolve("ok");
                self.metrics.set_brokers(set.len());
                info!(brokers = %set, "Broker membership changed");
                events.send_replace(Some(WatchEvent::MembershipChanged(set)));
            }
            Err(e) => {
                self.metrics.record_resolve("error");
                error!(error = %e, "Failed to resolve brokers after change");
            }
        }
    }
}

/// Consumer side of a running watcher
pub struct WatcherHandle {
    events: watch::Receiver<Option<WatchEvent>>,
    state: watch::Receiver<WatcherState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Next event; `None` once the watcher has stopped
    ///
    /// Events published while the caller was busy collapse into the latest.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            if self.events.changed().await.is_err() {
                return None;
            }
            if let Some(event) = self.events.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    /// Current loop state
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Independent view of the loop state
    pub fn state_watch(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Broker watcher task failed");
        }
    }
}
