//! Notification service HTTP surface.
//!
//! Preferences per network and per user, history and stats, silenced
//! devices, the scheduled-broadcast state machine (owner-only), test
//! notifications, anomaly baselines, and the health-check ingress used by
//! the collectors.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sv_auth::{ApiError, TokenAuthenticator};
use sv_types::{NetworkEvent, NotificationChannel, NotificationPriority, NotificationType};

use crate::broadcast::BroadcastUpdate;
use crate::config::NotifyConfig;
use crate::manager::NotificationManager;
use crate::prefs::{GlobalUserPreferences, NetworkPreferences};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct NotifyState {
    pub manager: Arc<NotificationManager>,
    pub authenticator: TokenAuthenticator,
    pub config: std::sync::RwLock<NotifyConfig>,
}

/// Build the notifications sub-router. Mounted at the service root.
pub fn notify_router() -> Router<Arc<NotifyState>> {
    Router::new()
        .route(
            "/api/notifications/process-health-check",
            post(process_health_check),
        )
        .route("/api/notifications/event", post(ingest_event))
        .route(
            "/api/notifications/preferences/{network_id}",
            get(get_preferences)
                .put(update_preferences)
                .delete(delete_preferences),
        )
        .route(
            "/api/notifications/global-preferences/{user_id}",
            get(get_global_preferences).put(update_global_preferences),
        )
        .route("/api/notifications/history", get(get_history))
        .route("/api/notifications/stats", get(get_stats))
        .route("/api/notifications/silenced", get(get_silenced).put(set_silenced))
        .route(
            "/api/notifications/silence/{device_ip}",
            post(silence_device).delete(unsilence_device),
        )
        .route(
            "/api/notifications/broadcasts",
            post(create_broadcast).get(list_broadcasts),
        )
        .route(
            "/api/notifications/broadcasts/{id}",
            get(get_broadcast).put(update_broadcast).delete(delete_broadcast),
        )
        .route("/api/notifications/broadcasts/{id}/cancel", post(cancel_broadcast))
        .route("/api/notifications/broadcasts/{id}/seen", post(mark_broadcast_seen))
        .route("/api/notifications/test/{channel}", post(send_test))
        .route(
            "/api/notifications/anomaly/baseline/{device_ip}",
            get(get_baseline),
        )
        .route("/api/notifications/anomaly/status", get(get_model_status))
        .route("/_internal/reload-env", post(reload_env))
}

// ---------------------------------------------------------------------------
// Query / body shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HealthCheckParams {
    pub device_ip: String,
    pub success: bool,
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub device_name: Option<String>,
    pub previous_state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    pub network_id: Option<String>,
    #[serde(flatten)]
    pub event: NetworkEvent,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub network_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastListQuery {
    #[serde(default)]
    pub include_completed: bool,
    pub network_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBroadcast {
    pub network_id: String,
    pub title: String,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub timezone: Option<String>,
    #[serde(default = "default_broadcast_type")]
    pub event_type: NotificationType,
    #[serde(default = "default_broadcast_priority")]
    pub priority: NotificationPriority,
}

fn default_broadcast_type() -> NotificationType {
    NotificationType::ScheduledMaintenance
}

fn default_broadcast_priority() -> NotificationPriority {
    NotificationPriority::Medium
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// POST /api/notifications/process-health-check -- collector ingress:
/// trains the anomaly baseline and emits state-transition events.
pub(crate) async fn process_health_check(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Query(params): Query<HealthCheckParams>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;

    let records = state
        .manager
        .process_health_check(
            &params.device_ip,
            params.success,
            params.latency_ms,
            params.packet_loss,
            params.device_name.as_deref(),
            params.previous_state.as_deref(),
        )
        .await;

    Ok(Json(json!({
        "processed": true,
        "notifications_sent": records.iter().filter(|r| r.success).count(),
        "notifications_failed": records.iter().filter(|r| !r.success).count(),
    })))
}

/// POST /api/notifications/event -- deliver an event to one network, or to
/// all networks when none is given.
pub(crate) async fn ingest_event(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Json(body): Json<IngestEvent>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;

    let records = match body.network_id.as_deref() {
        Some(network_id) => {
            state
                .manager
                .send_to_network(network_id, &body.event, body.force)
                .await
        }
        None if body.event.event_type.is_global() => {
            state.manager.send_global_notification(&body.event).await
        }
        None => {
            state
                .manager
                .broadcast_to_all_networks(&body.event, body.force)
                .await
        }
    };
    Ok(Json(json!({ "records": records })))
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

/// GET /api/notifications/preferences/{network_id}
pub(crate) async fn get_preferences(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(network_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    Ok(Json(json!(state.manager.prefs.network(&network_id))))
}

/// PUT /api/notifications/preferences/{network_id}
pub(crate) async fn update_preferences(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(network_id): Path<String>,
    Json(mut prefs): Json<NetworkPreferences>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;
    prefs.network_id = network_id;
    state.manager.prefs.update_network(prefs.clone());
    Ok(Json(json!(prefs)))
}

/// DELETE /api/notifications/preferences/{network_id}
pub(crate) async fn delete_preferences(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(network_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;
    if state.manager.prefs.delete_network(&network_id) {
        Ok(Json(json!({"detail": "Preferences deleted"})))
    } else {
        Err(ApiError::NotFound("No preferences for that network".into()))
    }
}

/// GET /api/notifications/global-preferences/{user_id}
pub(crate) async fn get_global_preferences(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    Ok(Json(json!(state.manager.prefs.global_for_user(&user_id))))
}

/// PUT /api/notifications/global-preferences/{user_id}
pub(crate) async fn update_global_preferences(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(mut prefs): Json<GlobalUserPreferences>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    prefs.user_id = user_id;
    state.manager.prefs.update_global(prefs.clone());
    Ok(Json(json!(prefs)))
}

// ---------------------------------------------------------------------------
// History / stats
// ---------------------------------------------------------------------------

/// GET /api/notifications/history
pub(crate) async fn get_history(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    let records = state
        .manager
        .history
        .recent(query.limit.unwrap_or(50), query.network_id.as_deref());
    Ok(Json(json!({ "notifications": records })))
}

/// GET /api/notifications/stats
pub(crate) async fn get_stats(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    Ok(Json(json!(state.manager.history.stats())))
}

// ---------------------------------------------------------------------------
// Silenced devices
// ---------------------------------------------------------------------------

/// GET /api/notifications/silenced
pub(crate) async fn get_silenced(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    let mut devices: Vec<String> = state.manager.prefs.silenced_devices().into_iter().collect();
    devices.sort();
    Ok(Json(json!({ "silenced_devices": devices })))
}

/// PUT /api/notifications/silenced -- replace the whole set.
pub(crate) async fn set_silenced(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Json(devices): Json<Vec<String>>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;
    state
        .manager
        .prefs
        .set_silenced_devices(devices.into_iter().collect());
    Ok(Json(json!({"detail": "Silenced devices updated"})))
}

/// POST /api/notifications/silence/{device_ip}
pub(crate) async fn silence_device(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(device_ip): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;
    let newly = state.manager.prefs.silence(&device_ip);
    Ok(Json(json!({"silenced": true, "already_silenced": !newly})))
}

/// DELETE /api/notifications/silence/{device_ip}
pub(crate) async fn unsilence_device(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(device_ip): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;
    if state.manager.prefs.unsilence(&device_ip) {
        Ok(Json(json!({"silenced": false})))
    } else {
        Err(ApiError::NotFound("Device was not silenced".into()))
    }
}

// ---------------------------------------------------------------------------
// Scheduled broadcasts (owner-only)
// ---------------------------------------------------------------------------

/// POST /api/notifications/broadcasts
pub(crate) async fn create_broadcast(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBroadcast>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = state.authenticator.require_owner(&headers, None)?;
    let broadcast = state.manager.broadcasts.create(
        &body.network_id,
        &body.title,
        &body.message,
        body.scheduled_at,
        body.timezone,
        &caller.user_id,
        body.event_type,
        body.priority,
    );
    Ok(Json(json!(broadcast)))
}

/// GET /api/notifications/broadcasts
pub(crate) async fn list_broadcasts(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Query(query): Query<BroadcastListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    let broadcasts = state
        .manager
        .broadcasts
        .list(query.include_completed, query.network_id.as_deref());
    Ok(Json(json!({ "broadcasts": broadcasts })))
}

/// GET /api/notifications/broadcasts/{id}
pub(crate) async fn get_broadcast(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    let broadcast = state
        .manager
        .broadcasts
        .get(&id)
        .ok_or_else(|| ApiError::NotFound("Broadcast not found".into()))?;
    Ok(Json(json!(broadcast)))
}

/// PUT /api/notifications/broadcasts/{id} -- pending only.
pub(crate) async fn update_broadcast(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<BroadcastUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_owner(&headers, None)?;
    match state.manager.broadcasts.update(&id, update) {
        Some(broadcast) => Ok(Json(json!(broadcast))),
        None => Err(ApiError::Conflict(
            "Broadcast not found or no longer pending".into(),
        )),
    }
}

/// POST /api/notifications/broadcasts/{id}/cancel -- pending only.
pub(crate) async fn cancel_broadcast(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_owner(&headers, None)?;
    if state.manager.broadcasts.cancel(&id) {
        Ok(Json(json!({"cancelled": true})))
    } else {
        Err(ApiError::Conflict(
            "Broadcast not found or no longer pending".into(),
        ))
    }
}

/// DELETE /api/notifications/broadcasts/{id} -- only once non-pending.
pub(crate) async fn delete_broadcast(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_owner(&headers, None)?;
    if state.manager.broadcasts.delete(&id) {
        Ok(Json(json!({"deleted": true})))
    } else {
        Err(ApiError::Conflict(
            "Broadcast not found or still pending".into(),
        ))
    }
}

/// POST /api/notifications/broadcasts/{id}/seen -- sent broadcasts only.
pub(crate) async fn mark_broadcast_seen(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    match state.manager.broadcasts.mark_seen(&id) {
        Some(seen_at) => Ok(Json(json!({"seen_at": seen_at}))),
        None => Err(ApiError::Conflict(
            "Broadcast not found, not sent, or already seen".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Test notifications / anomaly
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TestQuery {
    pub network_id: String,
}

/// POST /api/notifications/test/{channel}
pub(crate) async fn send_test(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(channel): Path<String>,
    Query(query): Query<TestQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.require_write(&headers, None)?;

    let channel = match channel.as_str() {
        "email" => NotificationChannel::Email,
        "discord" => NotificationChannel::Discord,
        other => return Err(ApiError::Validation(format!("unknown channel: {other}"))),
    };

    match state
        .manager
        .send_test_notification(&query.network_id, channel)
        .await
    {
        Ok(record) => Ok(Json(json!(record))),
        Err(reason) => Err(ApiError::Validation(reason)),
    }
}

/// GET /api/notifications/anomaly/baseline/{device_ip}
pub(crate) async fn get_baseline(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    Path(device_ip): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    let baseline = state
        .manager
        .anomaly
        .device_baseline(&device_ip)
        .ok_or_else(|| ApiError::NotFound("No baseline for that device".into()))?;
    Ok(Json(json!(baseline)))
}

/// GET /api/notifications/anomaly/status
pub(crate) async fn get_model_status(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.authenticator.authenticate(&headers, None)?;
    Ok(Json(json!(state.manager.anomaly.model_status())))
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// POST /_internal/reload-env -- service-token only.
pub(crate) async fn reload_env(
    State(state): State<Arc<NotifyState>>,
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
    Ok(Json(json!({"updated": updated})))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyDetector;
    use crate::broadcast::BroadcastStore;
    use crate::channels::{EmailChannel, LogOnlyTransport};
    use crate::history::NotificationHistory;
    use crate::members::MemoryNetworkMembers;
    use crate::prefs::PreferencesStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sv_auth::{TokenSigner, TokenVerifier};
    use sv_types::UserRole;
    use tower::ServiceExt;

    const SECRET: &str = "notify-route-secret";

    fn test_state() -> (Arc<NotifyState>, TokenSigner) {
        let dir = std::env::temp_dir().join(format!(
            "sv-notifyd-routes-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let members = Arc::new(MemoryNetworkMembers::new());
        members.add_network("net-1", "owner-1", &[]);
        let manager = Arc::new(NotificationManager::new(
            PreferencesStore::load(&dir),
            NotificationHistory::load(&dir),
            BroadcastStore::load(&dir),
            AnomalyDetector::load(&dir),
            vec![Arc::new(EmailChannel::new(Arc::new(LogOnlyTransport)))],
            members,
        ));

        let signer = TokenSigner::new(SECRET, "HS256").unwrap();
        let verifier = Arc::new(TokenVerifier::new(SECRET, "HS256").unwrap());
        let state = Arc::new(NotifyState {
            manager,
            authenticator: TokenAuthenticator::new(verifier),
            config: std::sync::RwLock::new(NotifyConfig::default()),
        });
        (state, signer)
    }

    fn app(state: Arc<NotifyState>) -> Router {
        notify_router().with_state(state)
    }

    fn owner_token(signer: &TokenSigner) -> String {
        signer
            .issue_user_token("owner-1", "owner", UserRole::Owner, chrono::Duration::hours(1))
            .unwrap()
    }

    #[tokio::test]
    async fn preferences_require_auth_and_round_trip() {
        let (state, signer) = test_state();
        let token = owner_token(&signer);

        let request = Request::builder()
            .uri("/api/notifications/preferences/net-1")
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/notifications/preferences/net-1")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut prefs: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        prefs["email"]["enabled"] = json!(true);
        prefs["email"]["email_address"] = json!("ops@example.com");

        let request = Request::builder()
            .method("PUT")
            .uri("/api/notifications/preferences/net-1")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(prefs.to_string()))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(state.manager.prefs.network("net-1").email.is_configured());
    }

    #[tokio::test]
    async fn broadcast_creation_is_owner_only() {
        let (state, signer) = test_state();
        let member_token = signer
            .issue_user_token("m1", "m", UserRole::Member, chrono::Duration::hours(1))
            .unwrap();

        let body = json!({
            "network_id": "net-1",
            "title": "Maintenance",
            "message": "Reboot",
            "scheduled_at": Utc::now() + chrono::Duration::hours(1),
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/notifications/broadcasts")
            .header("authorization", format!("Bearer {member_token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .method("POST")
            .uri("/api/notifications/broadcasts")
            .header("authorization", format!("Bearer {}", owner_token(&signer)))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_check_ingress_trains_baseline() {
        let (state, signer) = test_state();
        let token = signer.issue_service_token("health-service").unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/notifications/process-health-check?device_ip=10.0.0.1&success=true&latency_ms=12.5")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/api/notifications/anomaly/baseline/10.0.0.1")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let baseline: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(baseline["total_checks"], 1);
    }

    #[tokio::test]
    async fn unknown_test_channel_is_400() {
        let (state, signer) = test_state();
        let request = Request::builder()
            .method("POST")
            .uri("/api/notifications/test/pigeon?network_id=net-1")
            .header("authorization", format!("Bearer {}", owner_token(&signer)))
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn silence_endpoints() {
        let (state, signer) = test_state();
        let token = owner_token(&signer);

        let request = Request::builder()
            .method("POST")
            .uri("/api/notifications/silence/10.0.0.9")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.manager.prefs.is_silenced("10.0.0.9"));

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/notifications/silence/10.0.0.9")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Unsilencing again is a 404.
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/notifications/silence/10.0.0.9")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
