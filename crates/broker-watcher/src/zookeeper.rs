//! ZooKeeper-backed coordination client
//!
//! Thin adapter from `zookeeper-client` onto `CoordinationClient`. Paths are
//! absolute; the root namespace is applied by the callers.

use async_trait::async_trait;
use kafka_rest_core::prelude::*;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

/// ZooKeeper coordination client
pub struct ZkCoordination {
    servers: String,
    session_timeout: Duration,
    client: RwLock<Option<zk::Client>>,
}

impl ZkCoordination {
    /// Connect and establish the initial session
    pub async fn connect(servers: &str, session_timeout: Duration) -> Result<Self> {
        let client = Self::open_session(servers, session_timeout).await?;
        Ok(Self {
            servers: servers.to_string(),
            session_timeout,
            client: RwLock::new(Some(client)),
        })
    }

    async fn open_session(servers: &str, session_timeout: Duration) -> Result<zk::Client> {
        info!(servers, "Connecting to ZooKeeper");
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(servers)
            .await
            .map_err(|e| GatewayError::session_with_source("Failed to connect to ZooKeeper", e))?;
        info!(servers, "ZooKeeper session established");
        Ok(client)
    }

    async fn session(&self) -> Result<zk::Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::session("ZooKeeper client closed"))
    }
}

/// Classify a client error: session-level failures trigger reconnect
fn map_error(operation: &str, path: &str, error: zk::Error) -> GatewayError {
    match error {
        zk::Error::SessionExpired | zk::Error::ClientClosed => {
            GatewayError::session_with_source(format!("{} {}", operation, path), error)
        }
        other => GatewayError::discovery_with_source(format!("{} {}", operation, path), other),
    }
}

#[async_trait]
impl CoordinationClient for ZkCoordination {
    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.session()
            .await?
            .list_children(path)
            .await
            .map_err(|e| map_error("list children of", path, e))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let (data, _stat) = self
            .session()
            .await?
            .get_data(path)
            .await
            .map_err(|e| map_error("get data of", path, e))?;
        Ok(data)
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let (_children, watcher) = self
            .session()
            .await?
            .list_and_watch_children(path)
            .await
            .map_err(|e| map_error("watch children of", path, e))?;

        let path = path.to_string();
        Ok(Box::pin(async move {
            let event = watcher.changed().await;
            debug!(path, event_type = ?event.event_type, state = ?event.session_state, "Watch fired");
            match event.event_type {
                zk::EventType::Session => WatchFire::SessionExpired,
                _ => WatchFire::ChildrenChanged,
            }
        }))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<CreateOutcome> {
        let acls = zk::Acls::anyone_all();
        let options = match mode {
            CreateMode::Persistent => zk::CreateMode::Persistent.with_acls(acls),
            CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential.with_acls(acls),
        };

        match self.session().await?.create(path, data, &options).await {
            Ok((_stat, sequence)) => Ok(CreateOutcome::Created(match mode {
                CreateMode::Persistent => path.to_string(),
                CreateMode::EphemeralSequential => format!("{}{}", path, sequence),
            })),
            Err(zk::Error::NodeExists) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(map_error("create", path, e)),
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.client.write().await;
        if guard.is_none() {
            return Err(GatewayError::session("ZooKeeper client closed"));
        }
        let client = Self::open_session(&self.servers, self.session_timeout).await?;
        *guard = Some(client);
        Ok(())
    }

    async fn close(&self) {
        if self.client.write().await.take().is_some() {
            warn!(servers = %self.servers, "ZooKeeper session closed");
        }
    }
}
