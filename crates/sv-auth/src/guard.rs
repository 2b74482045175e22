use std::sync::Arc;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use sv_types::UserRole;
use tracing::debug;

use crate::api_error::ApiError;
use crate::token::{TokenKind, TokenVerifier, Verification};

// ---------------------------------------------------------------------------
// AuthenticatedUser
// ---------------------------------------------------------------------------

/// Caller identity after token verification, shared by every HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
    /// True for service-to-service identities.
    pub is_service: bool,
}

impl AuthenticatedUser {
    pub fn is_owner(&self) -> bool {
        self.role == UserRole::Owner
    }

    pub fn can_write(&self) -> bool {
        self.role.can_write()
    }
}

// ---------------------------------------------------------------------------
// TokenAuthenticator
// ---------------------------------------------------------------------------

/// Resolves bearer credentials into an [`AuthenticatedUser`] using the
/// shared token secret.
///
/// Service tokens are tried first so internal calls never round-trip through
/// the auth service; user session tokens are verified second. SSE clients
/// cannot set headers, so a `token` query parameter is accepted as fallback.
pub struct TokenAuthenticator {
    verifier: Arc<TokenVerifier>,
}

impl TokenAuthenticator {
    pub fn new(verifier: Arc<TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Pull the raw bearer token out of headers, falling back to `token=` in
    /// the query string.
    pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(String::from)
            .or_else(|| query_token.map(String::from))
    }

    /// Authenticate the request or fail with 401.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthenticatedUser, ApiError> {
        let raw = Self::extract_token(headers, query_token).ok_or(ApiError::NotAuthenticated)?;

        if let Verification::Valid(claims) = self.verifier.verify(&raw, TokenKind::Service) {
            debug!(service = %claims.sub, "authenticated service token");
            return Ok(AuthenticatedUser {
                user_id: claims.sub.clone(),
                username: claims.username.unwrap_or(claims.sub),
                role: UserRole::Owner,
                is_service: true,
            });
        }

        match self.verifier.verify(&raw, TokenKind::UserSession) {
            Verification::Valid(claims) => Ok(AuthenticatedUser {
                user_id: claims.sub.clone(),
                username: claims.username.unwrap_or(claims.sub),
                role: claims.role.unwrap_or(UserRole::Member),
                is_service: false,
            }),
            _ => Err(ApiError::InvalidToken),
        }
    }

    /// Authenticate and require write access (owner or admin).
    pub fn require_write(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthenticatedUser, ApiError> {
        let user = self.authenticate(headers, query_token)?;
        if !user.can_write() {
            return Err(ApiError::Forbidden("Write access required".into()));
        }
        Ok(user)
    }

    /// Authenticate and require the owner role.
    pub fn require_owner(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthenticatedUser, ApiError> {
        let user = self.authenticate(headers, query_token)?;
        if !user.is_owner() {
            return Err(ApiError::Forbidden("Owner access required".into()));
        }
        Ok(user)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenSigner;
    use chrono::Duration;

    const SECRET: &str = "guard-test-secret";

    fn setup() -> (TokenSigner, TokenAuthenticator) {
        let signer = TokenSigner::new(SECRET, "HS256").unwrap();
        let verifier = Arc::new(TokenVerifier::new(SECRET, "HS256").unwrap());
        (signer, TokenAuthenticator::new(verifier))
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        headers
    }

    #[test]
    fn user_token_authenticates() {
        let (signer, auth) = setup();
        let token = signer
            .issue_user_token("u1", "alice", UserRole::Member, Duration::hours(1))
            .unwrap();
        let user = auth.authenticate(&headers_with(&token), None).unwrap();
        assert_eq!(user.username, "alice");
        assert!(!user.is_service);
        assert!(!user.can_write());
    }

    #[test]
    fn service_token_gets_owner_access() {
        let (signer, auth) = setup();
        let token = signer.issue_service_token("metrics-service").unwrap();
        let user = auth.authenticate(&headers_with(&token), None).unwrap();
        assert!(user.is_service);
        assert!(user.is_owner());
        assert!(auth.require_owner(&headers_with(&token), None).is_ok());
    }

    #[test]
    fn query_token_fallback_for_sse() {
        let (signer, auth) = setup();
        let token = signer
            .issue_user_token("u1", "alice", UserRole::Owner, Duration::hours(1))
            .unwrap();
        let user = auth.authenticate(&HeaderMap::new(), Some(&token)).unwrap();
        assert_eq!(user.user_id, "u1");
    }

    #[test]
    fn missing_token_is_not_authenticated() {
        let (_signer, auth) = setup();
        assert!(matches!(
            auth.authenticate(&HeaderMap::new(), None),
            Err(ApiError::NotAuthenticated)
        ));
    }

    #[test]
    fn invalid_token_is_invalid() {
        let (_signer, auth) = setup();
        assert!(matches!(
            auth.authenticate(&headers_with("bogus"), None),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn member_fails_write_guard() {
        let (signer, auth) = setup();
        let token = signer
            .issue_user_token("u1", "m", UserRole::Member, Duration::hours(1))
            .unwrap();
        assert!(matches!(
            auth.require_write(&headers_with(&token), None),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn admin_passes_write_but_not_owner_guard() {
        let (signer, auth) = setup();
        let token = signer
            .issue_user_token("u1", "a", UserRole::Admin, Duration::hours(1))
            .unwrap();
        assert!(auth.require_write(&headers_with(&token), None).is_ok());
        assert!(matches!(
            auth.require_owner(&headers_with(&token), None),
            Err(ApiError::Forbidden(_))
        ));
    }
}
