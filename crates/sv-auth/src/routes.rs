//! Authentication HTTP surface.
//!
//! Endpoints: login/logout/verify/session, password reset request/confirm,
//! invite create/verify/accept/revoke, and first-run owner setup. All error
//! responses carry `{"detail": ...}` with the status mapping from
//! [`crate::ApiError`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sv_types::UserRole;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::config::AuthConfig;
use crate::guard::TokenAuthenticator;
use crate::password::{hash_password, verify_password};
use crate::store::{Invite, InviteStatus, User, UserStore};
use crate::sync::IdentitySync;
use crate::token::{TokenKind, TokenSigner, TokenVerifier, Verification};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AuthState {
    pub store: Arc<dyn UserStore>,
    pub signer: Arc<TokenSigner>,
    pub verifier: Arc<TokenVerifier>,
    pub sync: Arc<IdentitySync>,
    pub authenticator: TokenAuthenticator,
    pub config: AuthConfig,
}

impl AuthState {
    pub fn new(store: Arc<dyn UserStore>, config: AuthConfig) -> Result<Self, crate::token::TokenError> {
        let signer = Arc::new(TokenSigner::new(&config.jwt_secret, &config.jwt_algorithm)?);
        let verifier = Arc::new(TokenVerifier::new(&config.jwt_secret, &config.jwt_algorithm)?);
        Ok(Self {
            sync: Arc::new(IdentitySync::new(store.clone())),
            authenticator: TokenAuthenticator::new(verifier.clone()),
            store,
            signer,
            verifier,
            config,
        })
    }
}

/// Build the auth sub-router. Mounted under `/api/auth`.
pub fn auth_router() -> Router<Arc<AuthState>> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/verify", post(verify))
        .route("/api/auth/session", get(session))
        .route("/api/auth/setup", post(owner_setup))
        .route("/api/auth/password-reset/request", post(password_reset_request))
        .route("/api/auth/password-reset/confirm", post(password_reset_confirm))
        .route("/api/auth/invites", post(create_invite))
        .route("/api/auth/invites/{id}", delete(revoke_invite))
        .route("/api/auth/invite/verify", get(verify_invite))
        .route("/api/auth/invite/accept", post(accept_invite))
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
}

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Deserialize)]
pub struct InviteTokenQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct AcceptInviteRequest {
    pub token: String,
    pub username: String,
    pub password: String,
}

// ---------------------------------------------------------------------------
// Session endpoints
// ---------------------------------------------------------------------------

/// POST /api/auth/login -- exchange credentials for a session token.
pub(crate) async fn login(
    State(state): State<Arc<AuthState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let lookup = &body.username_or_email;
    let user = match state.store.get_user_by_username(lookup).await {
        Ok(Some(user)) => Some(user),
        Ok(None) => state
            .store
            .get_user_by_email(lookup)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    // One generic failure for unknown user, bad password, and inactive
    // account alike.
    let denied = || ApiError::Validation("Incorrect username or password".into());
    let user = user.ok_or_else(denied)?;
    let hash = user.password_hash.as_deref().ok_or_else(denied)?;
    if !verify_password(&body.password, hash) || !user.active {
        return Err(denied());
    }

    let token = state
        .signer
        .issue_user_token(
            &user.id.to_string(),
            &user.username,
            user.role,
            Duration::hours(state.config.session_ttl_hours),
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = %user.id, "user logged in");
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
        user_id: user.id.to_string(),
        username: user.username,
        role: user.role,
    }))
}

/// POST /api/auth/logout -- acknowledge logout. Session tokens are
/// stateless, so this only exists for client symmetry.
pub(crate) async fn logout() -> impl IntoResponse {
    Json(json!({"detail": "Logged out"}))
}

/// POST /api/auth/verify -- verify a bearer token for downstream services.
/// Responds 200 `{valid: true, ...}` for live users; any failure is an
/// opaque 401 `{valid: false}`.
pub(crate) async fn verify(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let invalid = || {
        (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(json!({"valid": false})),
        )
    };

    let Some(raw) = TokenAuthenticator::extract_token(&headers, None) else {
        return invalid();
    };
    let Verification::Valid(claims) = state.verifier.verify(&raw, TokenKind::UserSession) else {
        return invalid();
    };
    let Ok(user_id) = claims.sub.parse::<Uuid>() else {
        return invalid();
    };
    let Ok(Some(user)) = state.store.get_user(user_id).await else {
        return invalid();
    };
    if !user.active {
        return invalid();
    }

    (
        axum::http::StatusCode::OK,
        Json(json!({
            "valid": true,
            "user_id": user.id.to_string(),
            "username": user.username,
            "role": user.role,
        })),
    )
}

/// GET /api/auth/session -- current user info for the presented token.
pub(crate) async fn session(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = state.authenticator.authenticate(&headers, None)?;
    if identity.is_service {
        return Ok(Json(json!({
            "user_id": identity.user_id,
            "username": identity.username,
            "role": identity.role,
            "service": true,
        })));
    }

    let user_id: Uuid = identity
        .user_id
        .parse()
        .map_err(|_| ApiError::InvalidToken)?;
    let user = state
        .store
        .get_user(user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .filter(|u| u.active)
        .ok_or(ApiError::InvalidToken)?;

    Ok(Json(json!({
        "user_id": user.id.to_string(),
        "username": user.username,
        "email": user.email,
        "role": user.role,
        "verified": user.verified,
        "timezone": user.timezone,
    })))
}

/// POST /api/auth/setup -- create the first (owner) account. Refused once
/// any user exists.
pub(crate) async fn owner_setup(
    State(state): State<Arc<AuthState>>,
    Json(body): Json<SetupRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let count = state
        .store
        .count_users()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if count > 0 {
        return Err(ApiError::Forbidden("Setup has already been completed".into()));
    }

    let mut owner = User::new(body.username.clone(), body.email.clone(), UserRole::Owner);
    owner.verified = true;
    owner.password_hash =
        Some(hash_password(&body.password).map_err(|e| ApiError::Internal(e.to_string()))?);
    state
        .store
        .create_user(&owner)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let token = state
        .signer
        .issue_user_token(
            &owner.id.to_string(),
            &owner.username,
            UserRole::Owner,
            Duration::hours(state.config.session_ttl_hours),
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = %owner.id, "owner account created");
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
        user_id: owner.id.to_string(),
        username: owner.username,
        role: UserRole::Owner,
    }))
}

// ---------------------------------------------------------------------------
// Password reset
// ---------------------------------------------------------------------------

/// POST /api/auth/password-reset/request -- issue a one-shot reset token.
/// Always answers 200 so the endpoint cannot be used to probe for accounts.
pub(crate) async fn password_reset_request(
    State(state): State<Arc<AuthState>>,
    Json(body): Json<ResetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Ok(Some(user)) = state.store.get_user_by_email(&body.email).await {
        match state.signer.issue_password_reset_token(
            &user.id.to_string(),
            Duration::minutes(state.config.password_reset_ttl_minutes),
        ) {
            // Delivery goes through the mail channel; the token never
            // appears in the response.
            Ok(_token) => info!(user_id = %user.id, "password reset token issued"),
            Err(e) => warn!(error = %e, "failed to issue reset token"),
        }
    }
    Ok(Json(json!({
        "detail": "If that account exists, a reset link has been sent"
    })))
}

/// POST /api/auth/password-reset/confirm -- redeem a reset token.
pub(crate) async fn password_reset_confirm(
    State(state): State<Arc<AuthState>>,
    Json(body): Json<ResetConfirmRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Verification::Valid(claims) = state.verifier.verify(&body.token, TokenKind::PasswordReset)
    else {
        return Err(ApiError::InvalidToken);
    };
    let user_id: Uuid = claims.sub.parse().map_err(|_| ApiError::InvalidToken)?;
    let mut user = state
        .store
        .get_user(user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or(ApiError::InvalidToken)?;

    user.password_hash =
        Some(hash_password(&body.new_password).map_err(|e| ApiError::Internal(e.to_string()))?);
    user.updated_at = Utc::now();
    state
        .store
        .update_user(&user)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = %user.id, "password reset completed");
    Ok(Json(json!({"detail": "Password updated"})))
}

// ---------------------------------------------------------------------------
// Invites
// ---------------------------------------------------------------------------

/// POST /api/auth/invites -- create an invite (owner/admin only). The invite
/// token rides in the response for delivery by the caller.
pub(crate) async fn create_invite(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
    Json(body): Json<CreateInviteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = state.authenticator.require_write(&headers, None)?;

    if state
        .store
        .get_user_by_email(&body.email)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .is_some()
    {
        return Err(ApiError::Conflict("A user with that email already exists".into()));
    }

    let invite = Invite {
        id: Uuid::new_v4(),
        email: body.email.clone(),
        role: body.role,
        status: InviteStatus::Pending,
        expires_at: Utc::now() + Duration::hours(state.config.invite_ttl_hours),
        created_by: caller.user_id.parse().unwrap_or_else(|_| Uuid::nil()),
        created_at: Utc::now(),
    };
    state
        .store
        .create_invite(&invite)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let token = state
        .signer
        .issue_invite_token(
            &invite.id.to_string(),
            &invite.email,
            invite.role,
            Duration::hours(state.config.invite_ttl_hours),
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(invite_id = %invite.id, email = %invite.email, "invite created");
    Ok(Json(json!({
        "id": invite.id.to_string(),
        "email": invite.email,
        "role": invite.role,
        "status": invite.status,
        "expires_at": invite.expires_at,
        "token": token,
    })))
}

/// DELETE /api/auth/invites/{id} -- revoke a pending invite.
pub(crate) async fn revoke_invite(
    State(state): State<Arc<AuthState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.authenticator.require_write(&headers, None)?;

    let mut invite = state
        .store
        .get_invite(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("Invite not found".into()))?;
    if invite.status != InviteStatus::Pending {
        return Err(ApiError::Conflict("Invite is no longer pending".into()));
    }

    invite.status = InviteStatus::Revoked;
    state
        .store
        .update_invite(&invite)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"detail": "Invite revoked"})))
}

async fn load_pending_invite(state: &AuthState, token: &str) -> Result<Invite, ApiError> {
    let Verification::Valid(claims) = state.verifier.verify(token, TokenKind::Invite) else {
        return Err(ApiError::InvalidToken);
    };
    let invite_id: Uuid = claims.sub.parse().map_err(|_| ApiError::InvalidToken)?;
    let invite = state
        .store
        .get_invite(invite_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or(ApiError::InvalidToken)?;

    if invite.status != InviteStatus::Pending || invite.expires_at < Utc::now() {
        return Err(ApiError::InvalidToken);
    }
    Ok(invite)
}

/// GET /api/auth/invite/verify?token= -- check an invite token before the
/// signup form renders.
pub(crate) async fn verify_invite(
    State(state): State<Arc<AuthState>>,
    Query(query): Query<InviteTokenQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invite = load_pending_invite(&state, &query.token).await?;
    Ok(Json(json!({
        "valid": true,
        "email": invite.email,
        "role": invite.role,
    })))
}

/// POST /api/auth/invite/accept -- redeem an invite and create the account.
pub(crate) async fn accept_invite(
    State(state): State<Arc<AuthState>>,
    Json(body): Json<AcceptInviteRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let mut invite = load_pending_invite(&state, &body.token).await?;

    let mut user = User::new(body.username.clone(), invite.email.clone(), invite.role);
    user.verified = true;
    user.password_hash =
        Some(hash_password(&body.password).map_err(|e| ApiError::Internal(e.to_string()))?);

    match state.store.create_user(&user).await {
        Ok(()) => {}
        Err(crate::store::StoreError::UniqueViolation(detail)) => {
            return Err(ApiError::Conflict(detail));
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    }

    invite.status = InviteStatus::Accepted;
    state
        .store
        .update_invite(&invite)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let token = state
        .signer
        .issue_user_token(
            &user.id.to_string(),
            &user.username,
            user.role,
            Duration::hours(state.config.session_ttl_hours),
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = %user.id, invite_id = %invite.id, "invite accepted");
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
        user_id: user.id.to_string(),
        username: user.username,
        role: user.role,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryUserStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> Arc<AuthState> {
        let config = AuthConfig {
            jwt_secret: "route-test-secret".into(),
            ..AuthConfig::default()
        };
        Arc::new(AuthState::new(Arc::new(MemoryUserStore::new()), config).unwrap())
    }

    fn app(state: Arc<AuthState>) -> Router {
        auth_router().with_state(state)
    }

    async fn post_json(
        app: Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn setup_then_login_then_verify() {
        let state = test_state();

        let (status, setup) = post_json(
            app(state.clone()),
            "/api/auth/setup",
            json!({"username": "root", "email": "root@example.com", "password": "pw123456"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(setup["role"], "owner");

        // Second setup attempt is forbidden.
        let (status, _) = post_json(
            app(state.clone()),
            "/api/auth/setup",
            json!({"username": "x", "email": "x@example.com", "password": "pw123456"}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, login) = post_json(
            app(state.clone()),
            "/api/auth/login",
            json!({"username_or_email": "root@example.com", "password": "pw123456"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = login["access_token"].as_str().unwrap().to_string();

        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/verify")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_with_bad_password_is_generic_400() {
        let state = test_state();
        post_json(
            app(state.clone()),
            "/api/auth/setup",
            json!({"username": "root", "email": "root@example.com", "password": "pw123456"}),
        )
        .await;

        let (status, body) = post_json(
            app(state),
            "/api/auth/login",
            json!({"username_or_email": "root", "password": "nope"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Incorrect username or password");
    }

    #[tokio::test]
    async fn verify_without_token_is_401_with_valid_false() {
        let state = test_state();
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/verify")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["valid"], false);
    }

    #[tokio::test]
    async fn invite_flow_end_to_end() {
        let state = test_state();
        let (_, setup) = post_json(
            app(state.clone()),
            "/api/auth/setup",
            json!({"username": "root", "email": "root@example.com", "password": "pw123456"}),
        )
        .await;
        let owner_token = setup["access_token"].as_str().unwrap().to_string();

        // Owner creates an invite.
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/invites")
            .header("authorization", format!("Bearer {owner_token}"))
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"email": "new@example.com", "role": "member"}).to_string(),
            ))
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let invite: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let invite_token = invite["token"].as_str().unwrap().to_string();

        // Invitee verifies then accepts.
        let request = Request::builder()
            .uri(format!("/api/auth/invite/verify?token={invite_token}"))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, accepted) = post_json(
            app(state.clone()),
            "/api/auth/invite/accept",
            json!({"token": invite_token, "username": "newbie", "password": "pw123456"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["role"], "member");

        // Single redemption: a second accept fails.
        let (status, _) = post_json(
            app(state),
            "/api/auth/invite/accept",
            json!({"token": invite_token, "username": "again", "password": "pw123456"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invite_creation_requires_write_access() {
        let state = test_state();
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/invites")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"email": "new@example.com", "role": "member"}).to_string(),
            ))
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn password_reset_request_never_reveals_accounts() {
        let state = test_state();
        let (status, body) = post_json(
            app(state),
            "/api/auth/password-reset/request",
            json!({"email": "ghost@example.com"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["detail"].as_str().unwrap().contains("If that account exists"));
    }
}
