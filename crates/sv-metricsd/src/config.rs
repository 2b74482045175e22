use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

/// The publish interval never drops below 5 seconds.
pub const MIN_PUBLISH_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// MetricsConfig
// ---------------------------------------------------------------------------

/// Metrics service configuration from environment variables.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub env: String,
    pub port: u16,
    pub health_service_url: String,
    pub backend_service_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub metrics_publish_interval: u64,
    pub usage_batch_size: usize,
    pub usage_batch_interval_seconds: f64,
    pub cors_origins: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            env: "development".into(),
            port: 8004,
            health_service_url: "http://localhost:8001".into(),
            backend_service_url: "http://localhost:8000".into(),
            redis_url: "redis://localhost:6379".into(),
            jwt_secret: String::new(),
            jwt_algorithm: "HS256".into(),
            metrics_publish_interval: 30,
            usage_batch_size: 10,
            usage_batch_interval_seconds: 5.0,
            cors_origins: "*".into(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            env: env_var("ENV").unwrap_or(defaults.env),
            port: env_var("METRICS_SERVICE_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            health_service_url: env_var("HEALTH_SERVICE_URL")
                .unwrap_or(defaults.health_service_url),
            backend_service_url: env_var("BACKEND_SERVICE_URL")
                .unwrap_or(defaults.backend_service_url),
            redis_url: env_var("REDIS_URL").unwrap_or(defaults.redis_url),
            jwt_secret: env_var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_algorithm: env_var("JWT_ALGORITHM").unwrap_or(defaults.jwt_algorithm),
            metrics_publish_interval: env_var("METRICS_PUBLISH_INTERVAL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.metrics_publish_interval)
                .max(MIN_PUBLISH_INTERVAL_SECS),
            usage_batch_size: env_var("USAGE_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.usage_batch_size),
            usage_batch_interval_seconds: env_var("USAGE_BATCH_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.usage_batch_interval_seconds),
            cors_origins: env_var("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
        }
    }

    /// Validate security-sensitive settings; hard errors in production only.
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
            warn!("JWT_SECRET is not set; service tokens will not verify across services");
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
                "health_service_url" => apply(&mut self.health_service_url, value),
                "backend_service_url" => apply(&mut self.backend_service_url, value),
                "redis_url" => apply(&mut self.redis_url, value),
                "jwt_secret" => apply(&mut self.jwt_secret, value),
                "jwt_algorithm" => apply(&mut self.jwt_algorithm, value),
                "cors_origins" => apply(&mut self.cors_origins, value),
                "metrics_publish_interval" => match value.parse::<u64>() {
                    Ok(parsed) => {
                        let parsed = parsed.max(MIN_PUBLISH_INTERVAL_SECS);
                        if self.metrics_publish_interval != parsed {
                            self.metrics_publish_interval = parsed;
                            true
                        } else {
                            false
                        }
                    }
                    Err(_) => false,
                },
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_interval_override_is_floored() {
        let mut config = MetricsConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("metrics_publish_interval".to_string(), "1".to_string());
        let updated = config.apply_env_overrides(&overrides);
        assert_eq!(updated, vec!["metrics_publish_interval"]);
        assert_eq!(config.metrics_publish_interval, MIN_PUBLISH_INTERVAL_SECS);
    }

    #[test]
    fn production_requires_secret_and_cors() {
        let config = MetricsConfig {
            env: "production".into(),
            ..MetricsConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MetricsConfig {
            env: "production".into(),
            cors_origins: "https://app.example.com".into(),
            jwt_secret: "s".into(),
            ..MetricsConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_override_fields_are_ignored() {
        let mut config = MetricsConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("nonsense".to_string(), "x".to_string());
        assert!(config.apply_env_overrides(&overrides).is_empty());
    }
}
