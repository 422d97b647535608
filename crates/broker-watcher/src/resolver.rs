//! Broker set resolution
//!
//! Reads `<root>/brokers/ids/*` and assembles a complete `BrokerSet`.

use kafka_rest_core::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves the current broker membership from the coordination service
#[derive(Clone)]
pub struct BrokerResolver {
    client: Arc<dyn CoordinationClient>,
    ids_path: String,
}

impl BrokerResolver {
    pub fn new(client: Arc<dyn CoordinationClient>, address: &CoordinationAddress) -> Self {
        Self {
            client,
            ids_path: address.broker_ids_path(),
        }
    }

    /// Path whose children are the broker registrations
    pub fn ids_path(&self) -> &str {
        &self.ids_path
    }

    /// Resolve every registered broker, or fail without a partial set
    pub async fn resolve(&self) -> Result<BrokerSet> {
        let children = self.client.list_children(&self.ids_path).await.map_err(|e| {
            warn!(error = %e, path = %self.ids_path, "Failed to list broker ids");
            e
        })?;

        let mut addresses = Vec::with_capacity(children.len());
        for child in &children {
            let path = format!("{}/{}", self.ids_path, child);

            let raw = self.client.get_data(&path).await?;
            if raw.is_empty() {
                return Err(GatewayError::discovery(format!(
                    "broker record {} is empty",
                    path
                )));
            }

            let record = BrokerRecord::decode(&raw).map_err(|e| {
                GatewayError::discovery_with_source(format!("malformed broker record {}", path), e)
            })?;

            addresses.push(record.address());
        }

        let set = BrokerSet::new(addresses)?;
        debug!(brokers = %set, path = %self.ids_path, "Resolved broker set");
        Ok(set)
    }
}
