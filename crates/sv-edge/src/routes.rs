//! Edge HTTP surface: network/permission CRUD, layout load/save, and the
//! authenticated proxy routes to the downstream collectors.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sv_auth::{ApiError, AuthenticatedUser};
use tracing::info;
use uuid::Uuid;

use crate::config::EdgeConfig;
use crate::networks::{
    member_user_ids, Network, NetworkPermission, NetworkStore, NetworkStoreError, PermissionRole,
};
use crate::proxy::{ProxyClient, DEFAULT_TIMEOUT, LONG_TIMEOUT};
use crate::verify::RemoteAuthVerifier;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct EdgeState {
    pub store: Arc<dyn NetworkStore>,
    pub verify: RemoteAuthVerifier,
    pub proxy: ProxyClient,
    pub config: std::sync::RwLock<EdgeConfig>,
}

impl EdgeState {
    fn config_url(&self, pick: impl Fn(&EdgeConfig) -> String) -> String {
        pick(&self.config.read().expect("config lock poisoned"))
    }
}

/// Build the edge router. Mounted at the service root.
pub fn edge_router() -> Router<Arc<EdgeState>> {
    Router::new()
        .route("/api/networks", get(list_networks).post(create_network))
        .route(
            "/api/networks/{id}",
            get(get_network).put(update_network).delete(delete_network),
        )
        .route("/api/networks/{id}/members", get(list_members))
        .route(
            "/api/networks/{id}/permissions",
            get(list_permissions).post(grant_permission),
        )
        .route(
            "/api/networks/{id}/permissions/{user_id}",
            axum::routing::delete(revoke_permission),
        )
        .route(
            "/api/networks/{id}/layout",
            get(load_network_layout).put(save_network_layout),
        )
        .route("/api/load-layout", get(load_legacy_layout))
        .route("/api/assistant/chat", post(proxy_assistant_chat))
        .route("/api/assistant/{*path}", any(proxy_assistant))
        .route("/api/health/{*path}", any(proxy_health))
        .route("/api/notifications/{*path}", any(proxy_notifications))
        .route("/_internal/reload-env", post(reload_env))
}

// ---------------------------------------------------------------------------
// Access helpers
// ---------------------------------------------------------------------------

async fn load_network(state: &EdgeState, id: Uuid) -> Result<Network, ApiError> {
    state
        .store
        .get(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("Network not found".into()))
}

/// Viewing needs ownership, a permission row, or a service identity.
async fn ensure_can_view(
    state: &EdgeState,
    network: &Network,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    if user.is_service || network.owner_user_id == user.user_id {
        return Ok(());
    }
    let permission = state
        .store
        .get_permission(network.id, &user.user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if permission.is_some() {
        Ok(())
    } else {
        Err(ApiError::NotFound("Network not found".into()))
    }
}

/// Editing needs ownership, an editor permission, or a service identity.
async fn ensure_can_edit(
    state: &EdgeState,
    network: &Network,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    if user.is_service || network.owner_user_id == user.user_id {
        return Ok(());
    }
    let permission = state
        .store
        .get_permission(network.id, &user.user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match permission {
        Some(p) if p.role == PermissionRole::Editor => Ok(()),
        Some(_) => Err(ApiError::Forbidden("Editor access required".into())),
        None => Err(ApiError::NotFound("Network not found".into())),
    }
}

// ---------------------------------------------------------------------------
// Network CRUD
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateNetwork {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNetwork {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// GET /api/networks -- networks visible to the caller (all of them for
/// services).
pub(crate) async fn list_networks(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let networks = if user.is_service {
        state.store.list_all().await
    } else {
        state.store.list_for_user(&user.user_id).await
    }
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!(networks)))
}

/// POST /api/networks -- create a network owned by the caller.
pub(crate) async fn create_network(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Json(body): Json<CreateNetwork>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("Network name is required".into()));
    }

    let mut network = Network::new(user.user_id.clone(), body.name.trim());
    network.description = body.description;
    state
        .store
        .create(&network)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(network_id = %network.id, owner = %user.user_id, "network created");
    // The agent key is returned exactly once, at creation.
    Ok(Json(json!({
        "id": network.id,
        "owner_user_id": network.owner_user_id,
        "name": network.name,
        "description": network.description,
        "agent_key": network.agent_key,
        "created_at": network.created_at,
    })))
}

/// GET /api/networks/{id}
pub(crate) async fn get_network(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    ensure_can_view(&state, &network, &user).await?;
    Ok(Json(json!(network)))
}

/// PUT /api/networks/{id}
pub(crate) async fn update_network(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateNetwork>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let mut network = load_network(&state, id).await?;
    ensure_can_edit(&state, &network, &user).await?;

    if let Some(name) = body.name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("Network name is required".into()));
        }
        network.name = name.trim().to_string();
    }
    if body.description.is_some() {
        network.description = body.description;
    }
    network.updated_at = Utc::now();
    state
        .store
        .update(&network)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!(network)))
}

/// DELETE /api/networks/{id} -- network owner only.
pub(crate) async fn delete_network(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    if !user.is_service && network.owner_user_id != user.user_id {
        return Err(ApiError::Forbidden("Only the owner can delete a network".into()));
    }

    state
        .store
        .delete(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!(network_id = %id, "network deleted");
    Ok(Json(json!({"detail": "Network deleted"})))
}

/// GET /api/networks/{id}/members -- owner plus permission holders, the
/// recipient list for broadcasts.
pub(crate) async fn list_members(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    ensure_can_view(&state, &network, &user).await?;

    let members = member_user_ids(state.store.as_ref(), &network)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let payload: Vec<_> = members
        .into_iter()
        .map(|user_id| json!({"user_id": user_id}))
        .collect();
    Ok(Json(json!(payload)))
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GrantPermission {
    pub user_id: String,
    pub role: PermissionRole,
}

/// GET /api/networks/{id}/permissions
pub(crate) async fn list_permissions(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    ensure_can_view(&state, &network, &user).await?;
    let permissions = state
        .store
        .permissions(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!(permissions)))
}

/// POST /api/networks/{id}/permissions -- owner grants viewer/editor.
pub(crate) async fn grant_permission(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<GrantPermission>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    if !user.is_service && network.owner_user_id != user.user_id {
        return Err(ApiError::Forbidden("Only the owner can share a network".into()));
    }
    if body.user_id == network.owner_user_id || body.user_id == user.user_id {
        return Err(ApiError::Forbidden("Cannot grant a permission to yourself".into()));
    }

    let permission = NetworkPermission {
        network_id: id,
        user_id: body.user_id,
        role: body.role,
        created_at: Utc::now(),
    };
    match state.store.grant(&permission).await {
        Ok(()) => {
            info!(network_id = %id, user_id = %permission.user_id, "permission granted");
            Ok(Json(json!(permission)))
        }
        Err(NetworkStoreError::DuplicatePermission) => Err(ApiError::Conflict(
            "User already has a permission on this network".into(),
        )),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// DELETE /api/networks/{id}/permissions/{user_id}
pub(crate) async fn revoke_permission(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path((id, target)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    if !user.is_service && network.owner_user_id != user.user_id {
        return Err(ApiError::Forbidden("Only the owner can revoke permissions".into()));
    }

    if state
        .store
        .revoke(id, &target)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    {
        Ok(Json(json!({"detail": "Permission revoked"})))
    } else {
        Err(ApiError::NotFound("No such permission".into()))
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

/// GET /api/networks/{id}/layout
pub(crate) async fn load_network_layout(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let network = load_network(&state, id).await?;
    ensure_can_view(&state, &network, &user).await?;
    Ok(Json(json!({
        "network_id": network.id,
        "layout_data": network.layout_data,
    })))
}

/// PUT /api/networks/{id}/layout
pub(crate) async fn save_network_layout(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(layout): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let mut network = load_network(&state, id).await?;
    ensure_can_edit(&state, &network, &user).await?;

    network.layout_data = Some(layout);
    network.updated_at = Utc::now();
    state
        .store
        .update(&network)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"detail": "Layout saved"})))
}

/// GET /api/load-layout -- pre-multi-tenant endpoint the aggregator falls
/// back to; serves the caller's first network.
pub(crate) async fn load_legacy_layout(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let networks = if user.is_service {
        state.store.list_all().await
    } else {
        state.store.list_for_user(&user.user_id).await
    }
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let layout = networks.into_iter().find_map(|n| n.layout_data);
    match layout {
        Some(layout) => Ok(Json(json!({"exists": true, "layout": layout}))),
        None => Ok(Json(json!({"exists": false}))),
    }
}

// ---------------------------------------------------------------------------
// Proxy routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

fn join_url(base: &str, prefix: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{base}{prefix}/{path}?{query}"),
        None => format!("{base}{prefix}/{path}"),
    }
}

/// POST /api/assistant/chat -- SSE relay to the assistant service. The
/// downstream enforces the daily chat quota; its 429 propagates with the
/// retry-after intact.
pub(crate) async fn proxy_assistant_chat(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user = state
        .verify
        .current_user(&headers, query.token.as_deref())
        .await?;
    let url = format!(
        "{}/api/assistant/chat",
        state.config_url(|c| c.assistant_service_url.clone())
    );
    state
        .proxy
        .forward_sse(Method::POST, &url, &headers, body, Some(&user))
        .await
}

/// ANY /api/assistant/{path} -- buffered forwarding to the assistant
/// service.
pub(crate) async fn proxy_assistant(
    State(state): State<Arc<EdgeState>>,
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let url = join_url(
        &state.config_url(|c| c.assistant_service_url.clone()),
        "/api/assistant",
        &path,
        query.as_deref(),
    );
    // Chat-adjacent endpoints can be slow; everything else uses the default.
    let timeout = if path.starts_with("chat") {
        LONG_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    };
    state
        .proxy
        .forward(method, &url, &headers, body, Some(&user), timeout)
        .await
}

/// ANY /api/health/{path} -- forwarding to the health collector. Speed test
/// runs get the long timeout.
pub(crate) async fn proxy_health(
    State(state): State<Arc<EdgeState>>,
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;

    // Mutating health endpoints need write access; reads are open to any
    // authenticated caller.
    if method != Method::GET && !user.can_write() {
        return Err(ApiError::Forbidden("Write access required".into()));
    }

    let url = join_url(
        &state.config_url(|c| c.health_service_url.clone()),
        "/api/health",
        &path,
        query.as_deref(),
    );
    let timeout = if path.starts_with("speedtest") {
        LONG_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    };
    state
        .proxy
        .forward(method, &url, &headers, body, Some(&user), timeout)
        .await
}

/// ANY /api/notifications/{path} -- forwarding to the notification service.
pub(crate) async fn proxy_notifications(
    State(state): State<Arc<EdgeState>>,
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user = state.verify.current_user(&headers, None).await?;
    let url = join_url(
        &state.config_url(|c| c.notification_service_url.clone()),
        "/api/notifications",
        &path,
        query.as_deref(),
    );
    state
        .proxy
        .forward(method, &url, &headers, body, Some(&user), DEFAULT_TIMEOUT)
        .await
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// POST /_internal/reload-env -- service-token only.
pub(crate) async fn reload_env(
    State(state): State<Arc<EdgeState>>,
    headers: HeaderMap,
    Json(overrides): Json<std::collections::HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = state.verify.current_user(&headers, None).await?;
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
