use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// NotifyConfig
// ---------------------------------------------------------------------------

/// Notification service configuration from environment variables.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub env: String,
    pub port: u16,
    /// Directory holding the JSON persistence files.
    pub data_dir: PathBuf,
    pub backend_service_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub cors_origins: String,
    /// Scheduler tick for due broadcasts, seconds.
    pub scheduler_interval_seconds: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            env: "development".into(),
            port: 8005,
            data_dir: PathBuf::from("data"),
            backend_service_url: "http://localhost:8000".into(),
            redis_url: "redis://localhost:6379".into(),
            jwt_secret: String::new(),
            jwt_algorithm: "HS256".into(),
            cors_origins: "*".into(),
            scheduler_interval_seconds: 30,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            env: env_var("ENV").unwrap_or(defaults.env),
            port: env_var("NOTIFICATION_SERVICE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            data_dir: env_var("NOTIFICATION_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            backend_service_url: env_var("BACKEND_SERVICE_URL")
                .unwrap_or(defaults.backend_service_url),
            redis_url: env_var("REDIS_URL").unwrap_or(defaults.redis_url),
            jwt_secret: env_var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_algorithm: env_var("JWT_ALGORITHM").unwrap_or(defaults.jwt_algorithm),
            cors_origins: env_var("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
            scheduler_interval_seconds: env_var("SCHEDULER_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scheduler_interval_seconds)
                .clamp(1, 30),
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
                "backend_service_url" => apply(&mut self.backend_service_url, value),
                "redis_url" => apply(&mut self.redis_url, value),
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
