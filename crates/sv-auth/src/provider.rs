use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::Value;
use subtle::ConstantTimeEq;
use sv_types::{AuthMethod, AuthProviderKind, IdentityClaims};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::UserStore;
use crate::sync::IdentitySync;
use crate::token::{TokenKind, TokenVerifier, Verification};

// ---------------------------------------------------------------------------
// Errors / acks
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("webhook not configured")]
    WebhookNotConfigured,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("identity store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Acknowledgement returned to the IdP after a webhook was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookAck {
    pub event: String,
    pub handled: bool,
}

// ---------------------------------------------------------------------------
// AuthProvider trait
// ---------------------------------------------------------------------------

/// Seam between the platform and an identity provider.
///
/// `validate_*` resolve a raw credential to verified claims, or `None` when
/// the credential does not check out — transport failures also resolve to
/// `None`, callers treat the two identically.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn kind(&self) -> AuthProviderKind;

    async fn validate_token(&self, raw: &str) -> Option<IdentityClaims>;

    /// Resolve claims from request headers (bearer or provider cookie).
    async fn validate_session(&self, headers: &HeaderMap) -> Option<IdentityClaims>;

    async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookAck, ProviderError>;

    fn login_url(&self, redirect: &str) -> String;

    fn logout_url(&self, redirect: &str) -> String;

    async fn revoke_session(&self, session_id: &str) -> bool;
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

// ---------------------------------------------------------------------------
// LocalAuthProvider
// ---------------------------------------------------------------------------

/// Validates tokens this platform issued itself and resolves them against
/// the user store. Claims are returned only for active users.
pub struct LocalAuthProvider {
    verifier: Arc<TokenVerifier>,
    store: Arc<dyn UserStore>,
}

impl LocalAuthProvider {
    pub fn new(verifier: Arc<TokenVerifier>, store: Arc<dyn UserStore>) -> Self {
        Self { verifier, store }
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    fn kind(&self) -> AuthProviderKind {
        AuthProviderKind::Local
    }

    async fn validate_token(&self, raw: &str) -> Option<IdentityClaims> {
        let claims = match self.verifier.verify(raw, TokenKind::UserSession) {
            Verification::Valid(claims) => claims,
            _ => return None,
        };
        let user_id = claims.sub.parse().ok()?;
        let user = self.store.get_user(user_id).await.ok()??;
        if !user.active {
            debug!(user_id = %user.id, "rejected token for inactive user");
            return None;
        }

        let mut identity = IdentityClaims::new(AuthProviderKind::Local, user.id.to_string());
        identity.email = Some(user.email);
        identity.email_verified = user.verified;
        identity.first_name = user.first_name;
        identity.last_name = user.last_name;
        identity.avatar_url = user.avatar_url;
        identity.auth_method = Some(AuthMethod::Password);
        Some(identity)
    }

    async fn validate_session(&self, headers: &HeaderMap) -> Option<IdentityClaims> {
        self.validate_token(bearer(headers)?).await
    }

    async fn handle_webhook(
        &self,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> Result<WebhookAck, ProviderError> {
        // Local auth has no upstream IdP; nothing to process.
        Ok(WebhookAck {
            event: "noop".into(),
            handled: false,
        })
    }

    fn login_url(&self, redirect: &str) -> String {
        format!("/login?redirect={redirect}")
    }

    fn logout_url(&self, redirect: &str) -> String {
        format!("/logout?redirect={redirect}")
    }

    async fn revoke_session(&self, _session_id: &str) -> bool {
        // Local sessions are stateless bearer tokens; they expire, they are
        // not revoked.
        false
    }
}

// ---------------------------------------------------------------------------
// ExternalAuthProvider
// ---------------------------------------------------------------------------

/// Configuration for a remote IdP integration.
#[derive(Debug, Clone, Default)]
pub struct ExternalProviderConfig {
    pub api_url: String,
    pub frontend_url: String,
    /// Server-side API key. When absent the provider is disabled and every
    /// validation resolves to no claims.
    pub secret_key: Option<String>,
    /// Shared secret for webhook authenticity.
    pub webhook_secret: Option<String>,
}

/// Talks to a remote IdP to exchange an opaque session token for a verified
/// user, and keeps local users in sync through webhooks.
pub struct ExternalAuthProvider {
    kind: AuthProviderKind,
    config: ExternalProviderConfig,
    http: reqwest::Client,
    sync: Arc<IdentitySync>,
}

impl ExternalAuthProvider {
    pub fn new(
        kind: AuthProviderKind,
        config: ExternalProviderConfig,
        sync: Arc<IdentitySync>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            kind,
            config,
            http,
            sync,
        }
    }

    async fn fetch_json(&self, url: &str, secret: &str) -> Option<Value> {
        let response = self
            .http
            .get(url)
            .bearer_auth(secret)
            .send()
            .await
            .map_err(|e| warn!(url, error = %e, "idp request failed"))
            .ok()?;
        if !response.status().is_success() {
            debug!(url, status = %response.status(), "idp request rejected");
            return None;
        }
        response.json().await.ok()
    }

    fn data_to_claims(&self, user: &Value) -> Option<IdentityClaims> {
        let provider_user_id = user.get("id")?.as_str()?.to_string();
        let mut claims = IdentityClaims::new(self.kind, provider_user_id);
        claims.email = user
            .pointer("/email_addresses/0/email_address")
            .or_else(|| user.get("email"))
            .and_then(Value::as_str)
            .map(String::from);
        claims.email_verified = user
            .pointer("/email_addresses/0/verification/status")
            .and_then(Value::as_str)
            .map(|s| s == "verified")
            .unwrap_or(false);
        claims.first_name = user.get("first_name").and_then(Value::as_str).map(String::from);
        claims.last_name = user.get("last_name").and_then(Value::as_str).map(String::from);
        claims.avatar_url = user.get("image_url").and_then(Value::as_str).map(String::from);
        claims.auth_method = user
            .get("last_sign_in_strategy")
            .and_then(Value::as_str)
            .map(|s| match s {
                s if s.starts_with("oauth") => AuthMethod::SocialOauth,
                "passkey" => AuthMethod::Passkey,
                "email_link" | "magic_link" => AuthMethod::MagicLink,
                "saml" => AuthMethod::SamlSso,
                "oidc" => AuthMethod::OidcSso,
                _ => AuthMethod::Password,
            });
        Some(claims)
    }
}

#[async_trait]
impl AuthProvider for ExternalAuthProvider {
    fn kind(&self) -> AuthProviderKind {
        self.kind
    }

    async fn validate_token(&self, raw: &str) -> Option<IdentityClaims> {
        let secret = self.config.secret_key.as_deref()?;

        // Exchange the opaque session id for its user id, then fetch the
        // user record.
        let session_url = format!("{}/v1/sessions/{raw}", self.config.api_url);
        let session = self.fetch_json(&session_url, secret).await?;
        if session.get("status").and_then(Value::as_str) != Some("active") {
            return None;
        }
        let user_id = session.get("user_id")?.as_str()?;

        let user_url = format!("{}/v1/users/{user_id}", self.config.api_url);
        let user = self.fetch_json(&user_url, secret).await?;
        let mut claims = self.data_to_claims(&user)?;
        claims.session_id = Some(raw.to_string());
        Some(claims)
    }

    async fn validate_session(&self, headers: &HeaderMap) -> Option<IdentityClaims> {
        let token = bearer(headers).map(String::from).or_else(|| {
            // Session cookie fallback, `__session=<token>`.
            headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .and_then(|cookies| {
                    cookies.split(';').find_map(|c| {
                        c.trim().strip_prefix("__session=").map(String::from)
                    })
                })
        })?;
        self.validate_token(&token).await
    }

    async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookAck, ProviderError> {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .ok_or(ProviderError::WebhookNotConfigured)?;

        let provided = headers
            .get("x-webhook-secret")
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::InvalidSignature)?;
        if !bool::from(provided.as_bytes().ct_eq(secret.as_bytes())) {
            return Err(ProviderError::InvalidSignature);
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| ProviderError::MalformedPayload(e.to_string()))?;
        let event = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let data = payload.get("data").cloned().unwrap_or(Value::Null);

        let handled = match event.as_str() {
            "user.created" | "user.updated" => {
                if let Some(claims) = self.data_to_claims(&data) {
                    self.sync.sync_provider_user(&claims, true).await?;
                    true
                } else {
                    false
                }
            }
            "user.deleted" => {
                if let Some(id) = data.get("id").and_then(Value::as_str) {
                    self.sync.deactivate_provider_user(self.kind, id).await?
                } else {
                    false
                }
            }
            _ => {
                debug!(event, "ignoring unhandled webhook event");
                false
            }
        };

        Ok(WebhookAck { event, handled })
    }

    fn login_url(&self, redirect: &str) -> String {
        format!("{}/sign-in?redirect_url={redirect}", self.config.frontend_url)
    }

    fn logout_url(&self, redirect: &str) -> String {
        format!("{}/sign-out?redirect_url={redirect}", self.config.frontend_url)
    }

    async fn revoke_session(&self, session_id: &str) -> bool {
        let Some(secret) = self.config.secret_key.as_deref() else {
            return false;
        };
        let url = format!("{}/v1/sessions/{session_id}/revoke", self.config.api_url);
        match self.http.post(&url).bearer_auth(secret).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(session_id, error = %e, "session revocation failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::hash_password;
    use crate::store::{MemoryUserStore, User};
    use crate::token::TokenSigner;
    use chrono::Duration;
    use sv_types::UserRole;

    const SECRET: &str = "provider-test-secret";

    async fn seeded() -> (Arc<MemoryUserStore>, LocalAuthProvider, TokenSigner, User) {
        let store = Arc::new(MemoryUserStore::new());
        let mut user = User::new("alice", "alice@example.com", UserRole::Admin);
        user.password_hash = Some(hash_password("pw").unwrap());
        store.create_user(&user).await.unwrap();

        let verifier = Arc::new(TokenVerifier::new(SECRET, "HS256").unwrap());
        let signer = TokenSigner::new(SECRET, "HS256").unwrap();
        let provider = LocalAuthProvider::new(verifier, store.clone());
        (store, provider, signer, user)
    }

    #[tokio::test]
    async fn local_provider_resolves_active_user() {
        let (_store, provider, signer, user) = seeded().await;
        let token = signer
            .issue_user_token(&user.id.to_string(), "alice", UserRole::Admin, Duration::hours(1))
            .unwrap();

        let claims = provider.validate_token(&token).await.unwrap();
        assert_eq!(claims.provider, AuthProviderKind::Local);
        assert_eq!(claims.provider_user_id, user.id.to_string());
        assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn local_provider_rejects_inactive_user() {
        let (store, provider, signer, mut user) = seeded().await;
        user.active = false;
        store.update_user(&user).await.unwrap();

        let token = signer
            .issue_user_token(&user.id.to_string(), "alice", UserRole::Admin, Duration::hours(1))
            .unwrap();
        assert!(provider.validate_token(&token).await.is_none());
    }

    #[tokio::test]
    async fn local_provider_rejects_garbage_and_missing_header() {
        let (_store, provider, _signer, _user) = seeded().await;
        assert!(provider.validate_token("garbage").await.is_none());
        assert!(provider.validate_session(&HeaderMap::new()).await.is_none());
    }

    #[tokio::test]
    async fn external_provider_without_secret_returns_no_claims() {
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
        let provider = ExternalAuthProvider::new(
            AuthProviderKind::Clerk,
            ExternalProviderConfig {
                api_url: "http://127.0.0.1:1".into(),
                frontend_url: "http://localhost".into(),
                secret_key: None,
                webhook_secret: None,
            },
            Arc::new(IdentitySync::new(store)),
        );
        assert!(provider.validate_token("sess_123").await.is_none());
        assert!(!provider.revoke_session("sess_123").await);
    }

    #[tokio::test]
    async fn webhook_requires_configuration_and_signature() {
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
        let unconfigured = ExternalAuthProvider::new(
            AuthProviderKind::Clerk,
            ExternalProviderConfig::default(),
            Arc::new(IdentitySync::new(store.clone())),
        );
        assert!(matches!(
            unconfigured.handle_webhook(&HeaderMap::new(), b"{}").await,
            Err(ProviderError::WebhookNotConfigured)
        ));

        let configured = ExternalAuthProvider::new(
            AuthProviderKind::Clerk,
            ExternalProviderConfig {
                webhook_secret: Some("whsec".into()),
                ..ExternalProviderConfig::default()
            },
            Arc::new(IdentitySync::new(store)),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-secret", "wrong".parse().unwrap());
        assert!(matches!(
            configured.handle_webhook(&headers, b"{}").await,
            Err(ProviderError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn webhook_user_created_syncs_user() {
        let store = Arc::new(MemoryUserStore::new());
        let provider = ExternalAuthProvider::new(
            AuthProviderKind::Clerk,
            ExternalProviderConfig {
                webhook_secret: Some("whsec".into()),
                ..ExternalProviderConfig::default()
            },
            Arc::new(IdentitySync::new(store.clone())),
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-webhook-secret", "whsec".parse().unwrap());
        let body = serde_json::json!({
            "type": "user.created",
            "data": {
                "id": "user_99",
                "email_addresses": [
                    {"email_address": "hook@example.com",
                     "verification": {"status": "verified"}}
                ],
                "first_name": "Hook"
            }
        });

        let ack = provider
            .handle_webhook(&headers, body.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(ack.event, "user.created");
        assert!(ack.handled);
        assert_eq!(store.count_users().await.unwrap(), 1);
    }
}
