use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sv_auth::TokenSigner;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::MetricsConfig;

/// Default per-call timeout for collector requests.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Speed tests run the full client measurement upstream.
const SPEED_TEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream timeout: {0}")]
    Timeout(String),
    #[error("unexpected upstream response: {0}")]
    Unexpected(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else if err.is_connect() {
            UpstreamError::Unavailable(err.to_string())
        } else {
            UpstreamError::Unexpected(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// UpstreamClient
// ---------------------------------------------------------------------------

/// Pooled HTTP client for the backend and health collectors.
///
/// All fetches authenticate with this service's long-lived service token and
/// degrade to empty data when a collector is unreachable; the aggregator
/// decides what a partial snapshot looks like.
pub struct UpstreamClient {
    http: reqwest::Client,
    health_url: String,
    backend_url: String,
    service_token: String,
}

impl UpstreamClient {
    pub fn new(config: &MetricsConfig, signer: &TokenSigner) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| UpstreamError::Unexpected(e.to_string()))?;
        let service_token = signer
            .issue_service_token("metrics-service")
            .map_err(|e| UpstreamError::Unexpected(e.to_string()))?;
        Ok(Self {
            http,
            health_url: config.health_service_url.clone(),
            backend_url: config.backend_service_url.clone(),
            service_token,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>, UpstreamError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.service_token)
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response.json().await?)),
            401 => {
                error!(url, "authentication failed against upstream; check JWT_SECRET");
                Ok(None)
            }
            404 => Ok(None),
            status => {
                debug!(url, status, "upstream returned non-success");
                Ok(None)
            }
        }
    }

    /// Fetch the saved layout for a network, or the legacy single-tenant
    /// layout when `network_id` is `None`. Returns the root layout node
    /// payload, or `None` when no layout exists.
    pub async fn fetch_network_layout(&self, network_id: Option<&str>) -> Option<Value> {
        let url = match network_id {
            Some(id) => format!("{}/api/networks/{id}/layout", self.backend_url),
            None => format!("{}/api/load-layout", self.backend_url),
        };

        let body = match self.get_json(&url).await {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(UpstreamError::Unavailable(_)) => {
                warn!("backend unavailable - cannot fetch network layout");
                return None;
            }
            Err(e) => {
                error!(error = %e, "failed to fetch network layout");
                return None;
            }
        };

        match network_id {
            Some(_) => body
                .get("layout_data")
                .and_then(|l| l.get("root"))
                .cloned(),
            None => {
                if body.get("exists").and_then(Value::as_bool).unwrap_or(false) {
                    body.pointer("/layout/root").cloned()
                } else {
                    None
                }
            }
        }
    }

    /// All network (tenant) ids known to the backend. Empty when the backend
    /// predates multi-tenancy or is unreachable.
    pub async fn fetch_all_network_ids(&self) -> Vec<String> {
        let url = format!("{}/api/networks", self.backend_url);
        match self.get_json(&url).await {
            Ok(Some(Value::Array(items))) => items
                .iter()
                .filter_map(|n| n.get("id").and_then(Value::as_str).map(String::from))
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "cannot enumerate networks");
                Vec::new()
            }
        }
    }

    /// Cached per-device health records, keyed by IP.
    pub async fn fetch_health_metrics(&self) -> HashMap<String, Value> {
        self.fetch_map(&format!("{}/api/health/cached", self.health_url))
            .await
    }

    /// Gateway probe-target metrics keyed by gateway IP. The metrics
    /// endpoint includes live status; fall back to the config-only endpoint
    /// when it is absent.
    pub async fn fetch_gateway_test_ips(&self) -> HashMap<String, Value> {
        let metrics_url = format!(
            "{}/api/health/gateway/test-ips/all/metrics",
            self.health_url
        );
        match self.get_json(&metrics_url).await {
            Ok(Some(Value::Object(map))) => {
                return map.into_iter().collect();
            }
            Ok(_) => {
                warn!("gateway metrics endpoint unavailable, falling back to config endpoint");
            }
            Err(e) => {
                warn!(error = %e, "cannot fetch gateway test ips");
                return HashMap::new();
            }
        }
        self.fetch_map(&format!("{}/api/health/gateway/test-ips/all", self.health_url))
            .await
    }

    /// Stored speed test results keyed by gateway IP.
    pub async fn fetch_speed_test_results(&self) -> HashMap<String, Value> {
        self.fetch_map(&format!("{}/api/health/speedtest/all", self.health_url))
            .await
    }

    /// Monitoring flags from the health service.
    pub async fn fetch_monitoring_status(&self) -> Option<Value> {
        match self.get_json(&format!("{}/api/health/monitoring/status", self.health_url)).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "cannot fetch monitoring status");
                None
            }
        }
    }

    /// Kick off a speed test on the health service and return the raw
    /// result. This is the one long-timeout call in the service.
    pub async fn trigger_speed_test(&self) -> Result<Value, UpstreamError> {
        let url = format!("{}/api/health/speedtest", self.health_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.service_token)
            .timeout(SPEED_TEST_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Unexpected(format!(
                "speed test returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn fetch_map(&self, url: &str) -> HashMap<String, Value> {
        match self.get_json(url).await {
            Ok(Some(Value::Object(map))) => map.into_iter().collect(),
            Ok(_) => HashMap::new(),
            Err(UpstreamError::Unavailable(_)) => {
                warn!(url, "collector unavailable");
                HashMap::new()
            }
            Err(e) => {
                error!(url, error = %e, "collector fetch failed");
                HashMap::new()
            }
        }
    }
}
