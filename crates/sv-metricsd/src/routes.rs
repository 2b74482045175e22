//! Metrics service HTTP surface.
//!
//! Snapshot retrieve/generate/publish, aggregator configuration, usage
//! statistics, the speed test trigger, and the WebSocket upgrade. Every
//! route except the health probes requires an authenticated caller.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sv_auth::{ApiError, TokenAuthenticator};
use sv_telemetry::UsageTracker;
use tracing::info;

use crate::aggregator::{parse_speed_test, Aggregator};
use crate::config::MetricsConfig;
use crate::hub::SnapshotHub;
use crate::publisher::BusPublisher;
use crate::upstream::UpstreamError;
use crate::ws::ws_handler;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct MetricsState {
    pub aggregator: Arc<Aggregator>,
    pub publisher: Arc<BusPublisher>,
    pub hub: SnapshotHub,
    pub usage: Arc<UsageTracker>,
    pub authenticator: TokenAuthenticator,
    pub config: std::sync::RwLock<MetricsConfig>,
}

/// Build the metrics sub-router. Mounted at the service root.
pub fn metrics_router() -> Router<Arc<MetricsState>> {
    Router::new()
        .route("/api/metrics/ws", get(ws_handler))
        .route("/api/metrics/snapshot", get(get_snapshot))
        .route("/api/metrics/snapshot/generate", post(generate_snapshot))
        .route("/api/metrics/publish", post(publish_now))
        .route("/api/metrics/config", get(get_config).post(update_config))
        .route("/api/metrics/usage", get(usage_stats))
        .route("/api/metrics/usage/reset", post(usage_reset))
        .route("/api/metrics/speedtest", post(trigger_speed_test))
        .route("/api/metrics/monitoring/status", get(monitoring_status))
        .route("/_internal/reload-env", post(reload_env))
}

// ---------------------------------------------------------------------------
// Query / body shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NetworkQuery {
    pub network_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    pub service: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub publish_interval_seconds: Option<u64>,
    pub publishing_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SpeedTestRequest {
    pub gateway_ip: String,
}

// ---------------------------------------------------------------------------
// Snapshot endpoints
// ---------------------------------------------------------------------------

/// GET /api/metrics/snapshot -- latest snapshot (optionally one network's).
pub(crate) async fn get_snapshot(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<NetworkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .authenticator
        .authenticate(&headers, query.token.as_deref())?;

    let network_id = query.network_id.as_deref();
    if let Some(snapshot) = state.aggregator.last_snapshot(network_id) {
        return Ok(Json(json!(snapshot)));
    }
    if let Some(snapshot) = state.publisher.load_last_snapshot(network_id).await {
        return Ok(Json(json!(snapshot)));
    }
    Err(ApiError::NotFound("No snapshot available yet".into()))
}

/// POST /api/metrics/snapshot/generate -- force a fresh snapshot.
pub(crate) async fn generate_snapshot(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<NetworkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .authenticator
        .authenticate(&headers, query.token.as_deref())?;

    let snapshot = state
        .aggregator
        .generate_snapshot(query.network_id.as_deref())
        .await
        .ok_or_else(|| ApiError::NotFound("No network layout available".into()))?;
    Ok(Json(json!(snapshot)))
}

/// POST /api/metrics/publish -- generate snapshots for every network and
/// push them onto the bus.
pub(crate) async fn publish_now(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<NetworkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .authenticator
        .require_write(&headers, query.token.as_deref())?;

    let snapshots = state.aggregator.generate_all_snapshots().await;
    let mut published = 0usize;
    for snapshot in snapshots.values() {
        if state.publisher.publish_topology_snapshot(snapshot).await {
            state.publisher.store_last_snapshot(snapshot).await;
            published += 1;
        }
    }

    info!(published, total = snapshots.len(), "manual publish completed");
    Ok(Json(json!({
        "published": published,
        "networks": snapshots.len(),
    })))
}

// ---------------------------------------------------------------------------
// Aggregator configuration
// ---------------------------------------------------------------------------

/// GET /api/metrics/config -- current aggregator configuration.
pub(crate) async fn get_config(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<NetworkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .authenticator
        .authenticate(&headers, query.token.as_deref())?;

    Ok(Json(json!({
        "publish_interval_seconds": state.aggregator.publish_interval_secs(),
        "publishing_enabled": state.aggregator.publishing_enabled(),
        "last_snapshot_id": state
            .aggregator
            .last_snapshot(None)
            .map(|s| s.snapshot_id),
    })))
}

/// POST /api/metrics/config -- update the publish interval or toggle.
pub(crate) async fn update_config(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Json(body): Json<ConfigUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;

    if let Some(secs) = body.publish_interval_seconds {
        state.aggregator.set_publish_interval_secs(secs);
    }
    if let Some(enabled) = body.publishing_enabled {
        state.aggregator.set_publishing_enabled(enabled);
    }

    Ok(Json(json!({
        "publish_interval_seconds": state.aggregator.publish_interval_secs(),
        "publishing_enabled": state.aggregator.publishing_enabled(),
    })))
}

// ---------------------------------------------------------------------------
// Usage statistics
// ---------------------------------------------------------------------------

/// GET /api/metrics/usage -- cross-service endpoint usage statistics.
pub(crate) async fn usage_stats(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<ServiceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .authenticator
        .authenticate(&headers, query.token.as_deref())?;

    let stats = state
        .usage
        .usage_stats(query.service.as_deref())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!(stats)))
}

/// POST /api/metrics/usage/reset -- reset usage statistics.
pub(crate) async fn usage_reset(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<ServiceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;

    state
        .usage
        .reset_stats(query.service.as_deref())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"detail": "Usage statistics reset"})))
}

// ---------------------------------------------------------------------------
// Speed test
// ---------------------------------------------------------------------------

/// POST /api/metrics/speedtest -- run a speed test for a gateway and publish
/// the result immediately.
pub(crate) async fn trigger_speed_test(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Json(body): Json<SpeedTestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;

    let raw = state
        .aggregator
        .upstream()
        .trigger_speed_test()
        .await
        .map_err(|e| match e {
            UpstreamError::Unavailable(detail) => ApiError::UpstreamUnavailable(detail),
            UpstreamError::Timeout(detail) => ApiError::UpstreamTimeout(detail),
            UpstreamError::Unexpected(detail) => ApiError::Internal(detail),
        })?;

    let result = parse_speed_test(&raw)
        .ok_or_else(|| ApiError::Internal("unparseable speed test result".into()))?;

    state.aggregator.cache_speed_test(&body.gateway_ip, result.clone());
    state
        .publisher
        .publish_speed_test_result(&body.gateway_ip, &result)
        .await;

    Ok(Json(json!(result)))
}

/// GET /api/metrics/monitoring/status -- monitoring flags from the health
/// collector.
pub(crate) async fn monitoring_status(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Query(query): Query<NetworkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .authenticator
        .authenticate(&headers, query.token.as_deref())?;

    match state.aggregator.upstream().fetch_monitoring_status().await {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::UpstreamUnavailable(
            "Health service unavailable".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// POST /_internal/reload-env -- hot-reload declared config fields during
/// blue/green swaps. Service-token only.
pub(crate) async fn reload_env(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
    Json(overrides): Json<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = state.authenticator.authenticate(&headers, None)?;
    if !caller.is_service {
        return Err(ApiError::Forbidden("Service access required".into()));
    }

    let updated = {
        let mut config = state.config.write().expect("config lock poisoned");
        config.apply_env_overrides(&overrides)
    };
    // The publish interval flows through to the live aggregator.
    if updated.iter().any(|f| f == "metrics_publish_interval") {
        let interval = state
            .config
            .read()
            .expect("config lock poisoned")
            .metrics_publish_interval;
        state.aggregator.set_publish_interval_secs(interval);
    }

    Ok(Json(json!({"updated": updated})))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use sv_auth::{TokenSigner, TokenVerifier};
    use sv_kv::MemoryKv;
    use tower::ServiceExt;

    const SECRET: &str = "metrics-route-secret";

    fn test_state() -> (Arc<MetricsState>, TokenSigner) {
        let config = MetricsConfig {
            jwt_secret: SECRET.into(),
            ..MetricsConfig::default()
        };
        let signer = TokenSigner::new(SECRET, "HS256").unwrap();
        let verifier = Arc::new(TokenVerifier::new(SECRET, "HS256").unwrap());
        let kv = Arc::new(MemoryKv::new());

        let upstream =
            Arc::new(crate::upstream::UpstreamClient::new(&config, &signer).unwrap());
        let state = Arc::new(MetricsState {
            aggregator: Arc::new(Aggregator::new(upstream, 30)),
            publisher: Arc::new(BusPublisher::new(kv.clone())),
            hub: SnapshotHub::new(),
            usage: Arc::new(UsageTracker::new(kv)),
            authenticator: TokenAuthenticator::new(verifier),
            config: std::sync::RwLock::new(config),
        });
        (state, signer)
    }

    fn app(state: Arc<MetricsState>) -> Router {
        metrics_router().with_state(state)
    }

    #[tokio::test]
    async fn snapshot_requires_auth() {
        let (state, _signer) = test_state();
        let request = Request::builder()
            .uri("/api/metrics/snapshot")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn snapshot_404_when_none_generated() {
        let (state, signer) = test_state();
        let token = signer.issue_service_token("test").unwrap();
        let request = Request::builder()
            .uri("/api/metrics/snapshot")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_round_trip_with_floor() {
        let (state, signer) = test_state();
        let token = signer.issue_service_token("test").unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/metrics/config")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"publish_interval_seconds": 2, "publishing_enabled": false}).to_string(),
            ))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        // Floored to the 5 s minimum.
        assert_eq!(body["publish_interval_seconds"], 5);
        assert_eq!(body["publishing_enabled"], false);
        assert!(!state.aggregator.publishing_enabled());
    }

    #[tokio::test]
    async fn reload_env_is_service_only() {
        let (state, signer) = test_state();
        let user_token = signer
            .issue_user_token(
                "u1",
                "alice",
                sv_types::UserRole::Owner,
                chrono::Duration::hours(1),
            )
            .unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/_internal/reload-env")
            .header("authorization", format!("Bearer {user_token}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"cors_origins": "https://x"}).to_string()))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let service_token = signer.issue_service_token("deployer").unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/_internal/reload-env")
            .header("authorization", format!("Bearer {service_token}"))
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"cors_origins": "https://x", "metrics_publish_interval": "45"}).to_string(),
            ))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.aggregator.publish_interval_secs(), 45);
    }
}
