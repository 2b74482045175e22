use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use serde_json::Value;
use sv_auth::{ApiError, AuthenticatedUser, TokenAuthenticator, TokenKind, TokenVerifier, Verification};
use sv_types::UserRole;
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// RemoteAuthVerifier
// ---------------------------------------------------------------------------

/// Resolves caller identity for proxied routes.
///
/// Service tokens are self-contained and verified locally against the shared
/// secret. User tokens round-trip to the auth service so deactivated
/// accounts are rejected immediately; a dead auth service surfaces as 503
/// and a slow one as 504 rather than silently denying everyone.
pub struct RemoteAuthVerifier {
    http: reqwest::Client,
    auth_url: String,
    verifier: Arc<TokenVerifier>,
}

impl RemoteAuthVerifier {
    pub fn new(auth_url: impl Into<String>, verifier: Arc<TokenVerifier>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            auth_url: auth_url.into(),
            verifier,
        }
    }

    /// Authenticate the request; bearer header first, `token` query
    /// parameter as the SSE fallback.
    pub async fn current_user(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthenticatedUser, ApiError> {
        let raw = TokenAuthenticator::extract_token(headers, query_token)
            .ok_or(ApiError::NotAuthenticated)?;

        // Internal service-to-service calls never hit the auth service.
        if let Verification::Valid(claims) = self.verifier.verify(&raw, TokenKind::Service) {
            debug!(service = %claims.sub, "authenticated as service");
            return Ok(AuthenticatedUser {
                user_id: claims.sub.clone(),
                username: claims.username.unwrap_or(claims.sub),
                role: UserRole::Owner,
                is_service: true,
            });
        }

        let response = self
            .http
            .post(format!("{}/api/auth/verify", self.auth_url))
            .bearer_auth(&raw)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "auth service unreachable");
                if e.is_timeout() {
                    ApiError::UpstreamTimeout("Auth service timeout".into())
                } else {
                    ApiError::UpstreamUnavailable("Auth service unavailable".into())
                }
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ApiError::InvalidToken);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|_| ApiError::InvalidToken)?;
        if !body.get("valid").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ApiError::InvalidToken);
        }

        let role = body
            .get("role")
            .and_then(Value::as_str)
            .and_then(UserRole::parse)
            .unwrap_or(UserRole::Member);
        Ok(AuthenticatedUser {
            user_id: body
                .get("user_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            username: body
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            role,
            is_service: false,
        })
    }

    pub async fn require_write(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthenticatedUser, ApiError> {
        let user = self.current_user(headers, query_token).await?;
        if !user.can_write() {
            return Err(ApiError::Forbidden("Write access required".into()));
        }
        Ok(user)
    }

    pub async fn require_owner(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthenticatedUser, ApiError> {
        let user = self.current_user(headers, query_token).await?;
        if !user.is_owner() {
            return Err(ApiError::Forbidden("Owner access required".into()));
        }
        Ok(user)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
