//! Gateway self-registration
//!
//! Advertises this gateway as an ephemeral sequential node under
//! `<root>/<namespace>/id`, creating the parent chain first.

use kafka_rest_core::prelude::*;
use tracing::{debug, info};

/// Create every missing persistent node along `path`
pub async fn create_parents(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);

        match client.create(&current, &[], CreateMode::Persistent).await? {
            CreateOutcome::Created(_) => debug!(path = %current, "Created node"),
            CreateOutcome::AlreadyExists => {}
        }
    }
    Ok(())
}

/// Advertise `advertised` (`host:port`) and return the created node path
pub async fn register_gateway(
    client: &dyn CoordinationClient,
    address: &CoordinationAddress,
    namespace: &str,
    advertised: &str,
) -> Result<String> {
    if namespace.trim_matches('/').is_empty() {
        return Err(GatewayError::config("registration namespace is empty"));
    }
    let dir = address.path(namespace);
    create_parents(client, &dir).await?;

    let node = format!("{}/id", dir);
    match client
        .create(&node, advertised.as_bytes(), CreateMode::EphemeralSequential)
        .await?
    {
        CreateOutcome::Created(path) => {
            info!(path = %path, advertised, "Registered gateway");
            Ok(path)
        }
        CreateOutcome::AlreadyExists => Err(GatewayError::discovery(format!(
            "registration node {} already exists",
            node
        ))),
    }
}
