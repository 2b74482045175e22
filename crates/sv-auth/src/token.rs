use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sv_types::UserRole;
use thiserror::Error;
use tracing::debug;

/// Clock-skew allowance applied at verification.
const LEEWAY_SECS: u64 = 30;

/// Service tokens live for one year.
const SERVICE_TOKEN_DAYS: i64 = 365;

// ---------------------------------------------------------------------------
// TokenKind
// ---------------------------------------------------------------------------

/// The four token shapes the platform issues. Verifiers state which kind
/// they expect; a structurally valid token of the wrong kind is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Normal API auth for a person. TTL in hours.
    UserSession,
    /// Long-lived internal service-to-service identity.
    Service,
    /// Single-redemption invite, up to 72 h.
    Invite,
    /// One-shot password reset, minutes.
    PasswordReset,
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// JWT payload for every token kind. Optional fields are present depending
/// on the kind: `service` is set (true) only on service tokens, `scope`
/// distinguishes invite and reset tokens, `email` rides on invites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn is_service(&self) -> bool {
        self.service.unwrap_or(false)
    }

    fn kind(&self) -> TokenKind {
        if self.is_service() {
            TokenKind::Service
        } else {
            match self.scope.as_deref() {
                Some("invite") => TokenKind::Invite,
                Some("reset") => TokenKind::PasswordReset,
                _ => TokenKind::UserSession,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Verification outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Expired,
    Signature,
    Malformed,
    WrongKind,
}

/// Outcome of verifying a token. The reason is for logs and metrics only;
/// HTTP surfaces must not leak which check failed.
#[derive(Debug, Clone)]
pub enum Verification {
    Valid(Claims),
    Invalid(InvalidReason),
    Unknown,
}

impl Verification {
    pub fn into_claims(self) -> Option<Claims> {
        match self {
            Verification::Valid(claims) => Some(claims),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unsupported jwt algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

fn parse_algorithm(name: &str) -> Result<Algorithm, TokenError> {
    match name.to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(TokenError::UnsupportedAlgorithm(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// TokenSigner
// ---------------------------------------------------------------------------

/// Issues signed bearer tokens with the shared HS-family secret.
pub struct TokenSigner {
    key: EncodingKey,
    algorithm: Algorithm,
}

impl TokenSigner {
    pub fn new(secret: &str, algorithm: &str) -> Result<Self, TokenError> {
        Ok(Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            algorithm: parse_algorithm(algorithm)?,
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(self.algorithm), claims, &self.key)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Issue a normal user session token.
    pub fn issue_user_token(
        &self,
        user_id: &str,
        username: &str,
        role: UserRole,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        self.sign(&Claims {
            sub: user_id.to_string(),
            username: Some(username.to_string()),
            role: Some(role),
            service: None,
            scope: None,
            email: None,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        })
    }

    /// Issue a long-lived service-to-service token. Services act with owner
    /// role and always carry `service: true`.
    pub fn issue_service_token(&self, service_name: &str) -> Result<String, TokenError> {
        let now = Utc::now();
        self.sign(&Claims {
            sub: service_name.to_string(),
            username: Some(service_name.to_string()),
            role: Some(UserRole::Owner),
            service: Some(true),
            scope: None,
            email: None,
            iat: now.timestamp(),
            exp: (now + Duration::days(SERVICE_TOKEN_DAYS)).timestamp(),
        })
    }

    /// Issue a single-redemption invite token (TTL capped at 72 h).
    pub fn issue_invite_token(
        &self,
        invite_id: &str,
        email: &str,
        role: UserRole,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let ttl = ttl.min(Duration::hours(72));
        let now = Utc::now();
        self.sign(&Claims {
            sub: invite_id.to_string(),
            username: None,
            role: Some(role),
            service: None,
            scope: Some("invite".to_string()),
            email: Some(email.to_string()),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        })
    }

    /// Issue a one-shot password reset token.
    pub fn issue_password_reset_token(
        &self,
        user_id: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        self.sign(&Claims {
            sub: user_id.to_string(),
            username: None,
            role: None,
            service: None,
            scope: Some("reset".to_string()),
            email: None,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        })
    }
}

// ---------------------------------------------------------------------------
// TokenVerifier
// ---------------------------------------------------------------------------

/// Verifies bearer tokens against the shared secret.
///
/// The algorithm comes from configuration and is the only one accepted; the
/// value carried in the token header must match it. Expiry checks apply a
/// small leeway for clock skew.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, algorithm: &str) -> Result<Self, TokenError> {
        let mut validation = Validation::new(parse_algorithm(algorithm)?);
        validation.leeway = LEEWAY_SECS;
        validation.validate_exp = true;
        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Verify `token` expecting the given kind. Returns a structured outcome
    /// rather than an error: callers translate every non-`Valid` variant into
    /// the same opaque 401.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Verification {
        let claims = match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => {
                use jsonwebtoken::errors::ErrorKind;
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => InvalidReason::Expired,
                    ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                        InvalidReason::Signature
                    }
                    ErrorKind::InvalidToken
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_) => InvalidReason::Malformed,
                    _ => return Verification::Unknown,
                };
                debug!(?reason, "token verification failed");
                return Verification::Invalid(reason);
            }
        };

        if claims.kind() != expected {
            debug!(expected = ?expected, actual = ?claims.kind(), "token kind mismatch");
            return Verification::Invalid(InvalidReason::WrongKind);
        }

        Verification::Valid(claims)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
