//! HTTP ingest surface
//!
//! Any method on any path under `/topic` publishes the body to the topic
//! named by the last path segment. Every request, matched or not, gets an
//! access-log entry once its handler has finished.

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, Request, State},
    http::{header, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Extension, Router,
};
use kafka_rest_core::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Gateway, PairLease};

/// Path prefix routed to the ingest handler
pub const TOPIC_PREFIX: &str = "/topic";

/// Build the ingest router
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    let max_body = gateway.options().max_body_bytes;
    Router::new()
        .fallback(ingest)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn_with_state(gateway.clone(), access_log))
        .with_state(gateway)
}

/// Bind the ingest listener
pub async fn bind(listen: &str) -> Result<TcpListener> {
    TcpListener::bind(listen)
        .await
        .map_err(|source| GatewayError::Bind {
            address: listen.to_string(),
            source,
        })
}

/// Serve until `cancel` fires, then stop accepting and finish open requests
pub async fn serve(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|e| GatewayError::Http(e.to_string()))?;
    let app = build_router(gateway.clone()).into_make_service_with_connect_info::<SocketAddr>();

    gateway.mark_serving();
    info!(listen = %local, "Ingest API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| GatewayError::Http(e.to_string()))?;

    info!(listen = %local, "Ingest API stopped");
    Ok(())
}

/// Publish the request body to the topic named by the last path segment
async fn ingest(
    Extension(lease): Extension<Arc<PairLease>>,
    uri: Uri,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let path = uri.path();
    if !path.starts_with(TOPIC_PREFIX) {
        return (StatusCode::NOT_FOUND, "404 page not found").into_response();
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(path, error = %rejection, "Failed to read request body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to read your data: {}", rejection.body_text()),
            )
                .into_response();
        }
    };

    let topic = path.rsplit('/').next().unwrap_or_default();
    match lease.send_data(topic, body).await {
        Ok(position) => (
            StatusCode::OK,
            format!(
                "Your data is stored with unique identifier {}",
                position.identifier()
            ),
        )
            .into_response(),
        Err(e) => {
            error!(topic, pair = lease.id(), error = %e, "Failed to store your data");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to store your data: {}", e),
            )
                .into_response()
        }
    }
}

/// Capture the producer pair for the request and record it once handled
async fn access_log(
    State(gateway): State<Arc<Gateway>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();

    let method = request.method().to_string();
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let lease = Arc::new(gateway.lease());
    request.extensions_mut().insert(lease.clone());

    let response = next.run(request).await;
    let elapsed = started.elapsed();
    gateway.record_request(response.status().as_u16(), elapsed);

    let entry = AccessLogEntry {
        method,
        host,
        path,
        remote_addr,
        response_time_seconds: elapsed.as_secs_f64(),
    };
    debug!(
        method = %entry.method,
        host = %entry.host,
        request = %entry.path,
        remote_addr = %entry.remote_addr,
        response_time = entry.response_time_seconds,
        "rest api"
    );

    // the response never waits on the log path
    let topic = gateway.log_topic().to_string();
    tokio::spawn(async move {
        let result = match entry.encode() {
            Ok(bytes) => lease.send_log_entry(&topic, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(topic, error = %e, "Failed to enqueue access log entry");
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProducerFactory;
    use crate::GatewayOptions;
    use axum::body::{to_bytes, Body};
    use axum::http::Method;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn setup(options: GatewayOptions) -> (FakeProducerFactory, Arc<Gateway>, Router) {
        let factory = FakeProducerFactory::new();
        let gateway = Arc::new(
            Gateway::start(
                Arc::new(factory.clone()),
                BrokerSet::parse_list("kafka0:9092").unwrap(),
                options,
            )
            .await
            .unwrap(),
        );
        gateway.mark_serving();
        let router = build_router(gateway.clone());
        (factory, gateway, router)
    }

    fn request(method: Method, uri: &str, body: &'static str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "gateway.local:8080")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_publish_returns_record_identifier() {
        let (factory, _gateway, router) = setup(GatewayOptions::default()).await;
        factory.respond_with(3, 42);

        let response = router
            .oneshot(request(Method::POST, "/topic/orders", "hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "Your data is stored with unique identifier important/3/42"
        );

        let sends = factory.data_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].1, "orders");
        assert_eq!(sends[0].2, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_first_record_identifier() {
        let (_factory, _gateway, router) = setup(GatewayOptions::default()).await;

        let response = router
            .oneshot(request(Method::POST, "/topic/orders", "hello"))
            .await
            .unwrap();
        assert_eq!(
            body_text(response).await,
            "Your data is stored with unique identifier important/0/0"
        );
    }

    #[tokio::test]
    async fn test_topic_is_last_path_segment() {
        let (factory, _gateway, router) = setup(GatewayOptions::default()).await;

        let response = router
            .oneshot(request(Method::PUT, "/topics/eu/west/clicks?x=1", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(factory.data_sends()[0].1, "clicks");
    }

    #[tokio::test]
    async fn test_unmatched_path_is_not_found_but_logged() {
        let (factory, gateway, router) = setup(GatewayOptions::default()).await;

        let response = router
            .oneshot(request(Method::GET, "/health", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(factory.data_sends().is_empty());

        factory.wait_for_log_entries(1).await;
        let entries = factory.log_entries();
        assert_eq!(entries[0].1, gateway.log_topic());
    }

    #[tokio::test]
    async fn test_empty_topic_is_server_error() {
        let (factory, _gateway, router) = setup(GatewayOptions::default()).await;

        let response = router
            .oneshot(request(Method::POST, "/topic/", "x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(response).await,
            "Failed to store your data: topic name is empty"
        );
        assert!(factory.data_sends().is_empty());
    }

    #[tokio::test]
    async fn test_producer_error_is_reported() {
        let (factory, gateway, router) = setup(GatewayOptions::default()).await;
        factory.fail_data_sends("Broker: Unknown topic or partition");

        let response = router
            .oneshot(request(Method::POST, "/topic/orders", "x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_text(response).await,
            "Failed to store your data: Broker: Unknown topic or partition"
        );
        assert_eq!(gateway.stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_server_error() {
        let (factory, _gateway, router) = setup(GatewayOptions {
            max_body_bytes: 4,
            ..GatewayOptions::default()
        })
        .await;

        let response = router
            .oneshot(request(Method::POST, "/topic/orders", "too large"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(factory.data_sends().is_empty());
    }

    #[tokio::test]
    async fn test_access_log_entry_fields() {
        let (factory, gateway, router) = setup(GatewayOptions::default()).await;

        let mut req = request(Method::POST, "/topic/orders?trace=1", "x");
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 51000))));
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        factory.wait_for_log_entries(1).await;
        let (bound, topic, payload) = factory.log_entries().remove(0);
        assert_eq!(topic, "kafka_producer_access_log");
        assert_eq!(bound, gateway.brokers());

        let entry: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(entry["method"], "POST");
        assert_eq!(entry["host"], "gateway.local:8080");
        assert_eq!(entry["path"], "/topic/orders?trace=1");
        assert_eq!(entry["ip"], "10.1.2.3:51000");
        assert!(entry["response_time"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_stalled_log_path_does_not_delay_response() {
        let (factory, _gateway, router) = setup(GatewayOptions::default()).await;
        factory.stall_log();

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            router.oneshot(request(Method::POST, "/topic/orders", "x")),
        )
        .await
        .expect("response waited on the log path")
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        factory.wait_for_log_enqueues(1).await;
        assert!(factory.log_entries().is_empty());

        factory.release_log();
        factory.wait_for_log_entries(1).await;
    }

    #[tokio::test]
    async fn test_request_keeps_its_pair_across_restart() {
        let options = GatewayOptions {
            drain_timeout: Duration::from_secs(5),
            ..GatewayOptions::default()
        };
        let (factory, gateway, router) = setup(options).await;
        factory.gate_data_sends();

        let in_flight = tokio::spawn(router.clone().oneshot(request(Method::POST, "/topic/a", "1")));
        factory.wait_for_data_sends(1).await;

        let restart = tokio::spawn({
            let gateway = gateway.clone();
            async move {
                gateway
                    .restart(BrokerSet::parse_list("kafka1:9092").unwrap())
                    .await
            }
        });
        while gateway.brokers().bootstrap_servers() != "kafka1:9092" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        factory.release_data_sends();
        let late = router.oneshot(request(Method::POST, "/topic/b", "2")).await.unwrap();
        assert_eq!(late.status(), StatusCode::OK);
        assert_eq!(in_flight.await.unwrap().unwrap().status(), StatusCode::OK);
        restart.await.unwrap().unwrap();

        factory.wait_for_log_entries(2).await;
        let old = BrokerSet::parse_list("kafka0:9092").unwrap();
        let new = BrokerSet::parse_list("kafka1:9092").unwrap();

        let sends = factory.data_sends();
        let by_topic = |t: &str| sends.iter().find(|s| s.1 == t).map(|s| s.0.clone());
        assert_eq!(by_topic("a"), Some(old.clone()));
        assert_eq!(by_topic("b"), Some(new.clone()));

        // each access-log entry went through the same pair as its send
        let entries = factory.log_entries();
        let logged_on = |p: &str| {
            entries
                .iter()
                .find(|e| {
                    serde_json::from_slice::<serde_json::Value>(&e.2).unwrap()["path"] == p
                })
                .map(|e| e.0.clone())
        };
        assert_eq!(logged_on("/topic/a"), Some(old));
        assert_eq!(logged_on("/topic/b"), Some(new));
    }

    #[tokio::test]
    async fn test_serve_marks_serving_and_stops_on_cancel() {
        let factory = FakeProducerFactory::new();
        let gateway = Arc::new(
            Gateway::start(
                Arc::new(factory.clone()),
                BrokerSet::parse_list("kafka0:9092").unwrap(),
                GatewayOptions::default(),
            )
            .await
            .unwrap(),
        );
        let listener = bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(serve(gateway.clone(), listener, cancel.clone()));
        while gateway.state() != crate::GatewayState::Serving {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_bind_error() {
        let held = bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap().to_string();

        let err = bind(&addr).await.unwrap_err();
        assert!(matches!(err, GatewayError::Bind { .. }));
    }
}
