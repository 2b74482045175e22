use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// UserRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Owner,
    Admin,
    Member,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Owner => "owner",
            UserRole::Admin => "admin",
            UserRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Some(UserRole::Owner),
            "admin" => Some(UserRole::Admin),
            "member" => Some(UserRole::Member),
            _ => None,
        }
    }

    /// Owner and admin may mutate shared state; members are read-only.
    pub fn can_write(&self) -> bool {
        matches!(self, UserRole::Owner | UserRole::Admin)
    }
}

// ---------------------------------------------------------------------------
// AuthProviderKind / AuthMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProviderKind {
    Local,
    Clerk,
    Workos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    SocialOauth,
    SamlSso,
    OidcSso,
    MagicLink,
    Passkey,
}

// ---------------------------------------------------------------------------
// IdentityClaims
// ---------------------------------------------------------------------------

/// Verified identity returned by an auth provider. Immutable once built;
/// `provider_user_id` plus `provider` is the stable federation key, while
/// profile fields (names, avatar) may be refreshed on sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub provider: AuthProviderKind,
    pub provider_user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl IdentityClaims {
    pub fn new(provider: AuthProviderKind, provider_user_id: impl Into<String>) -> Self {
        Self {
            provider,
            provider_user_id: provider_user_id.into(),
            email: None,
            email_verified: false,
            first_name: None,
            last_name: None,
            avatar_url: None,
            auth_method: None,
            session_id: None,
            issued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_and_write_access() {
        assert_eq!(UserRole::parse("OWNER"), Some(UserRole::Owner));
        assert_eq!(UserRole::parse("viewer"), None);
        assert!(UserRole::Owner.can_write());
        assert!(UserRole::Admin.can_write());
        assert!(!UserRole::Member.can_write());
    }

    #[test]
    fn provider_kind_wire_format() {
        assert_eq!(
            serde_json::to_string(&AuthProviderKind::Workos).unwrap(),
            "\"workos\""
        );
    }

    #[test]
    fn claims_minimal_defaults() {
        let claims = IdentityClaims::new(AuthProviderKind::Clerk, "user_abc");
        assert!(claims.email.is_none());
        assert!(!claims.email_verified);
        assert!(claims.auth_method.is_none());
    }
}
