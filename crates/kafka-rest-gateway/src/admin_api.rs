//! Admin API for the Kafka REST gateway

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use kafka_rest_core::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Gateway, GatewayState, GatewayStats};

/// Admin API state
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    /// Watcher state, when running with discovery
    pub watcher: Option<Arc<dyn Fn() -> String + Send + Sync>>,
}

/// Health response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Stats response
#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub gateway: GatewayStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher: Option<String>,
    pub failure_rate: f64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(State(state): State<AdminState>) -> (StatusCode, &'static str) {
    match state.gateway.state() {
        GatewayState::Serving => (StatusCode::OK, "OK"),
        GatewayState::Restarting => (StatusCode::SERVICE_UNAVAILABLE, "RESTARTING"),
        GatewayState::Starting => (StatusCode::SERVICE_UNAVAILABLE, "STARTING"),
        GatewayState::Closed => (StatusCode::SERVICE_UNAVAILABLE, "CLOSED"),
    }
}

async fn stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    let s = state.gateway.stats();
    let failure_rate = if s.requests > 0 {
        s.failed_requests as f64 / s.requests as f64 * 100.0
    } else {
        0.0
    };
    Json(StatsResponse {
        watcher: state.watcher.as_ref().map(|f| f()),
        gateway: s,
        failure_rate,
    })
}

/// Admin router
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Run admin server until `cancel` fires
pub async fn run_admin_server(
    listen: String,
    state: AdminState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = crate::server::bind(&listen).await?;
    info!(listen, "Admin API started");
    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| GatewayError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProducerFactory;
    use crate::GatewayOptions;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn state() -> AdminState {
        let gateway = Gateway::start(
            Arc::new(FakeProducerFactory::new()),
            BrokerSet::parse_list("kafka0:9092,kafka1:9092").unwrap(),
            GatewayOptions::default(),
        )
        .await
        .unwrap();
        AdminState {
            gateway: Arc::new(gateway),
            watcher: Some(Arc::new(|| "Watching".to_string())),
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_ready_tracks_gateway_state() {
        let state = state().await;
        let gateway = state.gateway.clone();
        let router = admin_router(state);

        let (status, _) = get(router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        gateway.mark_serving();
        let (status, body) = get(router.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");

        gateway.close().await;
        let (status, body) = get(router, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "CLOSED");
    }

    #[tokio::test]
    async fn test_stats_reports_bound_brokers() {
        let state = state().await;
        state.gateway.mark_serving();
        let (status, body) = get(admin_router(state), "/stats").await;
        assert_eq!(status, StatusCode::OK);

        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["state"], "serving");
        assert_eq!(
            stats["brokers"],
            serde_json::json!(["kafka0:9092", "kafka1:9092"])
        );
        assert_eq!(stats["watcher"], "Watching");
        assert_eq!(stats["restarts"], 0);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(admin_router(state().await), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("healthy"));
    }
}
