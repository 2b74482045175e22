use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Auth service configuration from environment variables.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub env: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub database_url: String,
    pub redis_url: String,
    pub cors_origins: String,
    pub session_ttl_hours: i64,
    pub invite_ttl_hours: i64,
    pub password_reset_ttl_minutes: i64,
    pub rate_limit_exempt_roles: String,
    pub auth_provider: String,
    pub idp_api_url: String,
    pub idp_frontend_url: String,
    pub idp_secret_key: Option<String>,
    pub idp_webhook_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            env: "development".into(),
            port: 8002,
            jwt_secret: String::new(),
            jwt_algorithm: "HS256".into(),
            database_url: String::new(),
            redis_url: "redis://localhost:6379".into(),
            cors_origins: "*".into(),
            session_ttl_hours: 8,
            invite_ttl_hours: 72,
            password_reset_ttl_minutes: 15,
            rate_limit_exempt_roles: "owner,admin".into(),
            auth_provider: "local".into(),
            idp_api_url: String::new(),
            idp_frontend_url: String::new(),
            idp_secret_key: None,
            idp_webhook_secret: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl AuthConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            env: env_var("ENV").unwrap_or(defaults.env),
            port: env_var("AUTH_SERVICE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            jwt_secret: env_var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_algorithm: env_var("JWT_ALGORITHM").unwrap_or(defaults.jwt_algorithm),
            database_url: env_var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: env_var("REDIS_URL").unwrap_or(defaults.redis_url),
            cors_origins: env_var("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
            session_ttl_hours: env_var("SESSION_TTL_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.session_ttl_hours),
            invite_ttl_hours: env_var("INVITE_TTL_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.invite_ttl_hours),
            password_reset_ttl_minutes: env_var("PASSWORD_RESET_TTL_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.password_reset_ttl_minutes),
            rate_limit_exempt_roles: env_var("RATE_LIMIT_EXEMPT_ROLES")
                .unwrap_or(defaults.rate_limit_exempt_roles),
            auth_provider: env_var("AUTH_PROVIDER").unwrap_or(defaults.auth_provider),
            idp_api_url: env_var("IDP_API_URL").unwrap_or(defaults.idp_api_url),
            idp_frontend_url: env_var("IDP_FRONTEND_URL").unwrap_or(defaults.idp_frontend_url),
            idp_secret_key: env_var("IDP_SECRET_KEY"),
            idp_webhook_secret: env_var("IDP_WEBHOOK_SECRET"),
        }
    }

    /// Validate security-sensitive settings. In production a wildcard CORS
    /// origin or an empty JWT secret is a hard configuration error; in
    /// development they only warn.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env == "production" {
            if self.cors_origins.contains('*') {
                return Err(ConfigError::Invalid(
                    "CORS wildcard (*) is not allowed in production; \
                     set CORS_ORIGINS to specific allowed origins"
                        .into(),
                ));
            }
            if self.jwt_secret.is_empty() {
                return Err(ConfigError::Invalid(
                    "JWT_SECRET must be set in production; \
                     generate one with: openssl rand -hex 32"
                        .into(),
                ));
            }
        } else {
            if self.cors_origins.contains('*') {
                warn!("CORS allows all origins (*); restrict this in production");
            }
            if self.jwt_secret.is_empty() {
                warn!("JWT_SECRET is not set; generate one with: openssl rand -hex 32");
            }
        }
        Ok(())
    }

    /// Parse the comma-separated origin allowlist.
    pub fn cors_origins_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Roles exempt from daily quotas, lowercased.
    pub fn exempt_roles(&self) -> HashSet<String> {
        self.rate_limit_exempt_roles
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Hot-reload declared fields from a map of lowercased field names to
    /// values. Unknown names are ignored; the list of updated field names is
    /// returned.
    pub fn apply_env_overrides(&mut self, overrides: &HashMap<String, String>) -> Vec<String> {
        let mut updated = Vec::new();
        for (key, value) in overrides {
            let field = key.to_ascii_lowercase();
            let changed = match field.as_str() {
                "env" => apply(&mut self.env, value),
                "jwt_secret" => apply(&mut self.jwt_secret, value),
                "jwt_algorithm" => apply(&mut self.jwt_algorithm, value),
                "database_url" => apply(&mut self.database_url, value),
                "redis_url" => apply(&mut self.redis_url, value),
                "cors_origins" => apply(&mut self.cors_origins, value),
                "rate_limit_exempt_roles" => apply(&mut self.rate_limit_exempt_roles, value),
                "auth_provider" => apply(&mut self.auth_provider, value),
                "idp_api_url" => apply(&mut self.idp_api_url, value),
                "idp_frontend_url" => apply(&mut self.idp_frontend_url, value),
                "session_ttl_hours" => apply_parsed(&mut self.session_ttl_hours, value),
                "invite_ttl_hours" => apply_parsed(&mut self.invite_ttl_hours, value),
                "password_reset_ttl_minutes" => {
                    apply_parsed(&mut self.password_reset_ttl_minutes, value)
                }
                _ => false,
            };
            if changed {
                tracing::info!(field, "hot-reloaded config field");
                updated.push(field);
            }
        }
        updated
    }
}

fn apply(slot: &mut String, value: &str) -> bool {
    if slot != value {
        *slot = value.to_string();
        true
    } else {
        false
    }
}

fn apply_parsed<T: std::str::FromStr + PartialEq>(slot: &mut T, value: &str) -> bool {
    match value.parse::<T>() {
        Ok(parsed) if *slot != parsed => {
            *slot = parsed;
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
