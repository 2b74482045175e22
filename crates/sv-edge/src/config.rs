use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// EdgeConfig
// ---------------------------------------------------------------------------

/// Backend edge configuration from environment variables.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub env: String,
    pub port: u16,
    pub auth_service_url: String,
    pub metrics_service_url: String,
    pub health_service_url: String,
    pub notification_service_url: String,
    pub assistant_service_url: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub cors_origins: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            env: "development".into(),
            port: 8000,
            auth_service_url: "http://localhost:8002".into(),
            metrics_service_url: "http://localhost:8004".into(),
            health_service_url: "http://localhost:8001".into(),
            notification_service_url: "http://localhost:8005".into(),
            assistant_service_url: "http://localhost:8006".into(),
            database_url: String::new(),
            jwt_secret: String::new(),
            jwt_algorithm: "HS256".into(),
            cors_origins: "*".into(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl EdgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            env: env_var("ENV").unwrap_or(defaults.env),
            port: env_var("BACKEND_SERVICE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            auth_service_url: env_var("AUTH_SERVICE_URL").unwrap_or(defaults.auth_service_url),
            metrics_service_url: env_var("METRICS_SERVICE_URL")
                .unwrap_or(defaults.metrics_service_url),
            health_service_url: env_var("HEALTH_SERVICE_URL")
                .unwrap_or(defaults.health_service_url),
            notification_service_url: env_var("NOTIFICATION_SERVICE_URL")
                .unwrap_or(defaults.notification_service_url),
            assistant_service_url: env_var("ASSISTANT_SERVICE_URL")
                .unwrap_or(defaults.assistant_service_url),
            database_url: env_var("DATABASE_URL").unwrap_or(defaults.database_url),
            jwt_secret: env_var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_algorithm: env_var("JWT_ALGORITHM").unwrap_or(defaults.jwt_algorithm),
            cors_origins: env_var("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.env == "production" {
            if self.cors_origins.contains('*') {
                return Err(ConfigError::Invalid(
                    "CORS wildcard (*) is not allowed in production".into(),
                ));
            }
            if self.jwt_secret.is_empty() {
                return Err(ConfigError::Invalid(
                    "JWT_SECRET must be set in production".into(),
                ));
            }
        } else if self.jwt_secret.is_empty() {
            warn!("JWT_SECRET is not set");
        }
        Ok(())
    }

    pub fn cors_origins_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Hot-reload declared fields; returns the list of updated names.
    pub fn apply_env_overrides(&mut self, overrides: &HashMap<String, String>) -> Vec<String> {
        let mut updated = Vec::new();
        for (key, value) in overrides {
            let field = key.to_ascii_lowercase();
            let changed = match field.as_str() {
                "env" => apply(&mut self.env, value),
                "auth_service_url" => apply(&mut self.auth_service_url, value),
                "metrics_service_url" => apply(&mut self.metrics_service_url, value),
                "health_service_url" => apply(&mut self.health_service_url, value),
                "notification_service_url" => apply(&mut self.notification_service_url, value),
                "assistant_service_url" => apply(&mut self.assistant_service_url, value),
                "jwt_secret" => apply(&mut self.jwt_secret, value),
                "jwt_algorithm" => apply(&mut self.jwt_algorithm, value),
                "cors_origins" => apply(&mut self.cors_origins, value),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_report_updated_fields() {
        let mut config = EdgeConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert(
            "AUTH_SERVICE_URL".to_string(),
            "http://auth.internal:8002".to_string(),
        );
        overrides.insert("port".to_string(), "9999".to_string()); // not declared

        let updated = config.apply_env_overrides(&overrides);
        assert_eq!(updated, vec!["auth_service_url"]);
        assert_eq!(config.auth_service_url, "http://auth.internal:8002");
        assert_eq!(config.port, 8000);
    }
}
