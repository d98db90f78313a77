//! Health and metrics endpoints.
//!
//! - Liveness probes: `/health`, `/healthz`
//! - Readiness probes: `/ready`, `/readyz`
//! - Prometheus metrics: `/metrics`

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use pubsub::{HealthStatus, Messaging, SubscriptionInfo};
use serde::Serialize;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub messaging: Messaging,
    pub health_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
struct SubscriptionView {
    topic: String,
    state: String,
}

impl From<SubscriptionInfo> for SubscriptionView {
    fn from(info: SubscriptionInfo) -> Self {
        Self {
            topic: info.topic,
            state: info.state.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    backend: String,
    #[serde(flatten)]
    health: HealthStatus,
    subscriptions: Vec<SubscriptionView>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Always OK while the process serves requests.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// 503 when the broker is unreachable or a subscription died.
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.messaging.health_check(state.health_timeout).await;
    let code = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = ReadyResponse {
        backend: state.messaging.backend().to_string(),
        health,
        subscriptions: state
            .messaging
            .subscriptions()
            .into_iter()
            .map(SubscriptionView::from)
            .collect(),
    };
    (code, Json(body))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        pubsub::render_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pubsub::consumer_group::MemoryLog;
    use pubsub::{ConsumerGroupConfig, ConsumerGroupDriver};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(log: &MemoryLog) -> AppState {
        let driver = ConsumerGroupDriver::with_transport(
            Arc::new(log.clone()),
            ConsumerGroupConfig::new("memory://", "workers"),
        );
        AppState {
            messaging: driver.into(),
            health_timeout: Duration::from_millis(50),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = get(router(state(&MemoryLog::new())), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_reports_subscriptions() {
        let log = MemoryLog::new();
        let state = state(&log);
        state
            .messaging
            .subscribe("orders", Arc::new(crate::handlers::LoggingHandler))
            .await
            .unwrap();

        let (status, body) = get(router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["backend"], "consumer_group");
        assert_eq!(body["subscriptions"][0]["topic"], "orders");

        state.messaging.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_unavailable_when_broker_stalls() {
        let log = MemoryLog::new();
        log.set_unresponsive(true);

        let (status, body) = get(router(state(&log)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert!(body["reason"].as_str().is_some());
    }
}
