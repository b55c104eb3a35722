//! HTTP ingress for inbound events, plus health and outbox status.
//!
//! ## Endpoints
//!
//! - `POST /v1/events` - deliver an inbound event to the inbox
//! - `GET /health` - storage and metadata reachability
//! - `GET /v1/outbox/stats` - outbox queue counters

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::coordinator::{HealthReport, WriteCoordinator};
use crate::error::{EvidenceError, EvidenceResult};
use crate::inbox::{InboundEvent, InboxDelivery, InboxOutcome};
use crate::outbox::OutboxStats;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<WriteCoordinator>,
    pub deliveries: mpsc::Sender<InboxDelivery>,
}

type ApiError = (StatusCode, Json<Value>);

pub fn status_for(err: &EvidenceError) -> StatusCode {
    match err {
        EvidenceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EvidenceError::Forbidden(_) => StatusCode::FORBIDDEN,
        EvidenceError::NotFound(_) => StatusCode::NOT_FOUND,
        EvidenceError::Conflict(_) => StatusCode::CONFLICT,
        EvidenceError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        EvidenceError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: EvidenceError) -> ApiError {
    (
        status_for(&err),
        Json(json!({ "error": err.kind_label(), "message": err.to_string() })),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events", post(receive_event))
        .route("/v1/outbox/stats", get(outbox_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /v1/events
///
/// Responds once the inbox has committed (or rejected) the event, so a 2xx
/// means the producer may stop redelivering.
async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<InboxOutcome>, ApiError> {
    let (delivery, ack) = InboxDelivery::new(event);
    let unavailable = || api_error(EvidenceError::dependency("inbox", "consumer is not running"));
    state.deliveries.send(delivery).await.map_err(|_| unavailable())?;
    let outcome = ack.await.map_err(|_| unavailable())?;
    outcome.map(Json).map_err(|err| {
        warn!(error = %err, "inbound event not accepted");
        api_error(err)
    })
}

/// GET /health
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.coordinator.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /v1/outbox/stats
async fn outbox_stats(State(state): State<AppState>) -> Result<Json<OutboxStats>, ApiError> {
    state
        .coordinator
        .repository()
        .outbox_stats()
        .map(Json)
        .map_err(api_error)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(bind: &str, state: AppState, shutdown: F) -> EvidenceResult<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = bind
        .parse()
        .map_err(|err| EvidenceError::Config(format!("invalid bind address {}: {}", bind, err)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| EvidenceError::Config(format!("cannot bind {}: {}", addr, err)))?;
    info!(address = %addr, "event ingress listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| EvidenceError::Internal(format!("event ingress failed: {}", err)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{Settings, StorageKind};
    use crate::guard::{AuthService, CaseService, HttpAuthClient, HttpCaseClient};
    use crate::metadata::MetadataRepository;
    use crate::outbox::LogPublisher;
    use crate::runtime::Engine;
    use crate::storage::build_backend;

    fn engine() -> Engine {
        let mut settings = Settings::default();
        settings.storage.kind = StorageKind::Memory;
        let storage = build_backend(&settings.storage).expect("backend");
        let timeout = Duration::from_millis(50);
        let cases: Arc<dyn CaseService> =
            Arc::new(HttpCaseClient::new("http://127.0.0.1:9", timeout).expect("client"));
        let auth: Arc<dyn AuthService> =
            Arc::new(HttpAuthClient::new("http://127.0.0.1:9", timeout).expect("client"));
        Engine::assemble(
            settings,
            storage,
            MetadataRepository::in_memory().expect("repo"),
            cases,
            auth,
            Arc::new(LogPublisher),
        )
    }

    fn post_event(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/events")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&EvidenceError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&EvidenceError::dependency("case", "down")),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&EvidenceError::SizeLimitExceeded { limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&EvidenceError::storage("disk gone")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_event_ingress_round_trip() {
        let engine = engine();
        let running = engine.start();
        let app = router(AppState {
            coordinator: Arc::clone(engine.coordinator()),
            deliveries: running.inbox_sender(),
        });

        let body = r#"{"event_id":"evt-1","event_name":"case.deleted.v1","payload":{"case_id":"c1"}}"#;
        let first = app.clone().oneshot(post_event(body)).await.expect("first");
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(post_event(body)).await.expect("second");
        assert_eq!(second.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .expect("body");
        let outcome: InboxOutcome = serde_json::from_slice(&bytes).expect("outcome");
        assert_eq!(outcome, InboxOutcome::Duplicate);

        let bad = r#"{"event_id":"evt-2","event_name":"case.deleted.v1","payload":{}}"#;
        let rejected = app.clone().oneshot(post_event(bad)).await.expect("bad");
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let engine = engine();
        let (deliveries, _receiver) = mpsc::channel(1);
        let app = router(AppState {
            coordinator: Arc::clone(engine.coordinator()),
            deliveries,
        });

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("health");
        assert_eq!(health.status(), StatusCode::OK);

        let stats = app
            .oneshot(
                Request::builder()
                    .uri("/v1/outbox/stats")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("stats");
        assert_eq!(stats.status(), StatusCode::OK);
    }
}
