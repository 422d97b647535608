//! In-memory coordination client for tests
//!
//! Behaves like a tiny ZooKeeper: nodes keep creation order, children
//! watches are one-shot and fire on the next child mutation, and session
//! expiry fails every call until `reconnect` succeeds.

use async_trait::async_trait;
use kafka_rest_core::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{oneshot, watch};

#[derive(Default)]
struct MockState {
    /// path -> value, in creation order
    nodes: Vec<(String, Vec<u8>)>,
    /// parent path -> pending one-shot watches
    watches: HashMap<String, Vec<oneshot::Sender<WatchFire>>>,
    ephemeral: Vec<String>,
    fires: usize,
    list_calls: HashMap<String, usize>,
    expired: bool,
    closed: bool,
    reconnect_failures: u32,
    reconnects: usize,
    sequence: u64,
}

impl MockState {
    fn check_session(&self) -> Result<()> {
        if self.closed {
            return Err(GatewayError::session("client closed"));
        }
        if self.expired {
            return Err(GatewayError::session("session expired"));
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.iter().any(|(p, _)| p == path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .iter()
            .filter_map(|(p, _)| p.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn fire(&mut self, parent: &str) {
        if let Some(pending) = self.watches.remove(parent) {
            for tx in pending {
                if tx.send(WatchFire::ChildrenChanged).is_ok() {
                    self.fires += 1;
                }
            }
        }
    }

    fn upsert(&mut self, path: &str, data: Vec<u8>) {
        if let Some(node) = self.nodes.iter_mut().find(|(p, _)| p == path) {
            node.1 = data;
            return;
        }
        self.nodes.push((path.to_string(), data));
        self.fire(parent_of(path));
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &path[..idx],
    }
}

/// Scripted coordination client that counts watch registrations and fires
pub struct MockCoordination {
    state: Mutex<MockState>,
    registrations: watch::Sender<usize>,
}

impl MockCoordination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            registrations: watch::channel(0).0,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a broker under `<root>/brokers/ids/<id>`, firing any watch
    pub fn put_broker(&self, root: &str, id: &str, host: &str, port: u16) {
        let value = serde_json::json!({ "host": host, "port": port, "version": 4 });
        self.put_raw(&format!("{}/brokers/ids/{}", root, id), value.to_string().as_bytes());
    }

    /// Store a raw value, creating the node (and its parents) if needed
    pub fn put_raw(&self, path: &str, data: &[u8]) {
        let mut state = self.state();
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(segment);
            if !state.exists(&prefix) {
                state.upsert(&prefix, Vec::new());
            }
        }
        state.upsert(path, data.to_vec());
    }

    /// Delete a node, firing any watch on its parent
    pub fn remove(&self, path: &str) {
        let mut state = self.state();
        let before = state.nodes.len();
        state.nodes.retain(|(p, _)| p != path);
        if state.nodes.len() != before {
            state.fire(parent_of(path));
        }
    }

    /// Value stored at `path`, if any
    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.state()
            .nodes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
    }

    /// Paths of all nodes under `prefix`
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.state()
            .nodes
            .iter()
            .filter(|(p, _)| p.starts_with(prefix))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Expire the session: pending watches fire with `SessionExpired`
    pub fn expire_session(&self) {
        let mut state = self.state();
        state.expired = true;
        for (_, pending) in state.watches.drain() {
            for tx in pending {
                let _ = tx.send(WatchFire::SessionExpired);
            }
        }
        // ephemeral nodes die with the session
        let ephemeral = std::mem::take(&mut state.ephemeral);
        state.nodes.retain(|(p, _)| !ephemeral.contains(p));
    }

    /// Make the next `n` reconnect attempts fail
    pub fn fail_reconnects(&self, n: u32) {
        self.state().reconnect_failures = n;
    }

    /// Total watches armed so far
    pub fn registrations(&self) -> usize {
        *self.registrations.borrow()
    }

    /// Total watches that fired with `ChildrenChanged`
    pub fn fires(&self) -> usize {
        self.state().fires
    }

    /// Number of `list_children` calls against `path`
    pub fn list_calls(&self, path: &str) -> usize {
        self.state().list_calls.get(path).copied().unwrap_or(0)
    }

    pub fn reconnects(&self) -> usize {
        self.state().reconnects
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Wait until at least `n` watches have been armed
    pub async fn wait_for_registrations(&self, n: usize) {
        let mut rx = self.registrations.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

impl Default for MockCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationClient for MockCoordination {
    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let mut state = self.state();
        state.check_session()?;
        *state.list_calls.entry(path.to_string()).or_default() += 1;
        if !state.exists(path) {
            return Err(GatewayError::discovery(format!("no node {}", path)));
        }
        Ok(state.children(path))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.state();
        state.check_session()?;
        state
            .nodes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| GatewayError::discovery(format!("no node {}", path)))
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let rx = {
            let mut state = self.state();
            state.check_session()?;
            if !state.exists(path) {
                return Err(GatewayError::discovery(format!("no node {}", path)));
            }
            let (tx, rx) = oneshot::channel();
            state.watches.entry(path.to_string()).or_default().push(tx);
            rx
        };
        self.registrations.send_modify(|count| *count += 1);

        Ok(Box::pin(async move {
            rx.await.unwrap_or(WatchFire::SessionExpired)
        }))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<CreateOutcome> {
        let mut state = self.state();
        state.check_session()?;

        let parent = parent_of(path);
        if !parent.is_empty() && !state.exists(parent) {
            return Err(GatewayError::discovery(format!("no node {}", parent)));
        }

        let path = match mode {
            CreateMode::Persistent => {
                if state.exists(path) {
                    return Ok(CreateOutcome::AlreadyExists);
                }
                path.to_string()
            }
            CreateMode::EphemeralSequential => {
                let seq = state.sequence;
                state.sequence += 1;
                let path = format!("{}{:010}", path, seq);
                state.ephemeral.push(path.clone());
                path
            }
        };

        state.upsert(&path, data.to_vec());
        Ok(CreateOutcome::Created(path))
    }

    async fn reconnect(&self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(GatewayError::session("client closed"));
        }
        if state.reconnect_failures > 0 {
            state.reconnect_failures -= 1;
            return Err(GatewayError::session("connection refused"));
        }
        state.expired = false;
        state.reconnects += 1;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let zk = MockCoordination::new();
        zk.put_broker("", "1", "a", 1);

        let watch = zk.watch_children("/brokers/ids").await.unwrap();
        zk.put_broker("", "2", "b", 2);
        assert_eq!(watch.await, WatchFire::ChildrenChanged);

        // no watch armed: this change is not observed
        zk.put_broker("", "3", "c", 3);
        assert_eq!(zk.registrations(), 1);
        assert_eq!(zk.fires(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_fails_calls_until_reconnect() {
        let zk = MockCoordination::new();
        zk.put_broker("", "1", "a", 1);

        let watch = zk.watch_children("/brokers/ids").await.unwrap();
        zk.expire_session();
        assert_eq!(watch.await, WatchFire::SessionExpired);
        assert!(zk.list_children("/brokers/ids").await.unwrap_err().is_session_loss());

        zk.fail_reconnects(1);
        assert!(zk.reconnect().await.is_err());
        zk.reconnect().await.unwrap();
        assert_eq!(zk.list_children("/brokers/ids").await.unwrap(), vec!["1"]);
    }
}
