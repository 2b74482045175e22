use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sv_kv::{Kv, KvOp};
use tracing::{error, info};

// Key layout:
//   usage:<service>:<method>:<endpoint-underscored>  per-endpoint hash
//   usage:<service>:summary                          per-service hash
//   usage:<service>:endpoints                        set of endpoint keys
//   usage:services                                   set of service names
//   usage:meta                                       collection metadata
const USAGE_KEY_PREFIX: &str = "usage:";
const USAGE_SERVICE_KEY: &str = "usage:services";
const USAGE_META_KEY: &str = "usage:meta";

// ---------------------------------------------------------------------------
// Records and response shapes
// ---------------------------------------------------------------------------

/// A single observed request, as produced by the tracking middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointUsageRecord {
    pub service: String,
    pub method: String,
    pub endpoint: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl EndpointUsageRecord {
    fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }
}

/// Aggregated statistics for one endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub method: String,
    pub service: String,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_response_time_ms: f64,
    pub avg_response_time_ms: Option<f64>,
    pub min_response_time_ms: Option<f64>,
    pub max_response_time_ms: Option<f64>,
    pub status_codes: HashMap<String, u64>,
    pub first_accessed: Option<DateTime<Utc>>,
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceUsageSummary {
    pub service: String,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_errors: u64,
    pub avg_response_time_ms: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub endpoints: Vec<EndpointUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStatsResponse {
    pub total_services: usize,
    pub total_requests: u64,
    pub services: HashMap<String, ServiceUsageSummary>,
    pub collection_started: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// UsageTracker
// ---------------------------------------------------------------------------

/// Tracks endpoint usage statistics across all services.
///
/// All counters live in KV hash fields so increments are atomic across
/// processes. KV write failures are logged and the record is dropped;
/// usage tracking never fails a request.
pub struct UsageTracker {
    kv: Arc<dyn Kv>,
}

impl UsageTracker {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn endpoint_key(service: &str, method: &str, endpoint: &str) -> String {
        let normalized = endpoint.replace('/', "_");
        let normalized = normalized.trim_matches('_');
        format!("{USAGE_KEY_PREFIX}{service}:{method}:{normalized}")
    }

    /// Record one request. Counter updates go through a single pipeline;
    /// min/max need a read-then-conditional-write second round.
    pub async fn record_usage(&self, record: &EndpointUsageRecord) -> Result<(), sv_kv::KvError> {
        let endpoint_key = Self::endpoint_key(&record.service, &record.method, &record.endpoint);
        let service_key = format!("{USAGE_KEY_PREFIX}{}:summary", record.service);
        let endpoints_key = format!("{USAGE_KEY_PREFIX}{}:endpoints", record.service);
        let timestamp = record.timestamp.to_rfc3339();

        let (success_field, service_success_field) = if record.is_success() {
            ("success_count", "total_successes")
        } else {
            ("error_count", "total_errors")
        };

        let ops = vec![
            KvOp::HincrBy {
                key: endpoint_key.clone(),
                field: "request_count".into(),
                delta: 1,
            },
            KvOp::HincrBy {
                key: endpoint_key.clone(),
                field: success_field.into(),
                delta: 1,
            },
            KvOp::HincrByFloat {
                key: endpoint_key.clone(),
                field: "total_response_time_ms".into(),
                delta: record.response_time_ms,
            },
            KvOp::HincrBy {
                key: endpoint_key.clone(),
                field: format!("status:{}", record.status_code),
                delta: 1,
            },
            KvOp::Hset {
                key: endpoint_key.clone(),
                field: "endpoint".into(),
                value: record.endpoint.clone(),
            },
            KvOp::Hset {
                key: endpoint_key.clone(),
                field: "method".into(),
                value: record.method.clone(),
            },
            KvOp::Hset {
                key: endpoint_key.clone(),
                field: "service".into(),
                value: record.service.clone(),
            },
            KvOp::Hset {
                key: endpoint_key.clone(),
                field: "last_accessed".into(),
                value: timestamp.clone(),
            },
            KvOp::Hget {
                key: endpoint_key.clone(),
                field: "min_response_time_ms".into(),
            },
            KvOp::Hget {
                key: endpoint_key.clone(),
                field: "max_response_time_ms".into(),
            },
            KvOp::Sadd {
                key: endpoints_key,
                member: endpoint_key.clone(),
            },
            KvOp::Sadd {
                key: USAGE_SERVICE_KEY.into(),
                member: record.service.clone(),
            },
            KvOp::HincrBy {
                key: service_key.clone(),
                field: "total_requests".into(),
                delta: 1,
            },
            KvOp::HincrBy {
                key: service_key.clone(),
                field: service_success_field.into(),
                delta: 1,
            },
            KvOp::HincrByFloat {
                key: service_key.clone(),
                field: "total_response_time_ms".into(),
                delta: record.response_time_ms,
            },
            KvOp::Hset {
                key: service_key,
                field: "last_updated".into(),
                value: timestamp.clone(),
            },
            KvOp::Hset {
                key: USAGE_META_KEY.into(),
                field: "last_updated".into(),
                value: timestamp.clone(),
            },
            KvOp::Hsetnx {
                key: USAGE_META_KEY.into(),
                field: "collection_started".into(),
                value: timestamp.clone(),
            },
        ];

        let results = self.kv.pipeline(ops).await?;

        // Positions 8 and 9 hold the current min/max readings.
        let current_min = results
            .get(8)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());
        let current_max = results
            .get(9)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());

        let mut followup = Vec::new();
        if current_min.map(|m| record.response_time_ms < m).unwrap_or(true) {
            followup.push(KvOp::Hset {
                key: endpoint_key.clone(),
                field: "min_response_time_ms".into(),
                value: record.response_time_ms.to_string(),
            });
        }
        if current_max.map(|m| record.response_time_ms > m).unwrap_or(true) {
            followup.push(KvOp::Hset {
                key: endpoint_key.clone(),
                field: "max_response_time_ms".into(),
                value: record.response_time_ms.to_string(),
            });
        }
        followup.push(KvOp::Hsetnx {
            key: endpoint_key,
            field: "first_accessed".into(),
            value: timestamp,
        });
        self.kv.pipeline(followup).await?;

        Ok(())
    }

    /// Record a batch; returns how many were stored successfully.
    pub async fn record_batch(&self, records: &[EndpointUsageRecord]) -> usize {
        let mut stored = 0;
        for record in records {
            match self.record_usage(record).await {
                Ok(()) => stored += 1,
                Err(e) => error!(error = %e, "failed to record usage"),
            }
        }
        stored
    }

    /// Aggregated statistics, optionally filtered to one service.
    pub async fn usage_stats(
        &self,
        service: Option<&str>,
    ) -> Result<UsageStatsResponse, sv_kv::KvError> {
        let mut response = UsageStatsResponse::default();

        let meta = self.kv.hgetall(USAGE_META_KEY).await?;
        response.collection_started = meta
            .get("collection_started")
            .and_then(|s| s.parse::<DateTime<Utc>>().ok());
        response.last_updated = meta
            .get("last_updated")
            .and_then(|s| s.parse::<DateTime<Utc>>().ok());

        let services: Vec<String> = match service {
            Some(name) => {
                if self.kv.sismember(USAGE_SERVICE_KEY, name).await? {
                    vec![name.to_string()]
                } else {
                    Vec::new()
                }
            }
            None => self.kv.smembers(USAGE_SERVICE_KEY).await?,
        };

        response.total_services = services.len();
        for name in services {
            if let Some(summary) = self.service_summary(&name).await? {
                response.total_requests += summary.total_requests;
                response.services.insert(name, summary);
            }
        }

        Ok(response)
    }

    async fn service_summary(
        &self,
        service: &str,
    ) -> Result<Option<ServiceUsageSummary>, sv_kv::KvError> {
        let service_key = format!("{USAGE_KEY_PREFIX}{service}:summary");
        let data = self.kv.hgetall(&service_key).await?;
        if data.is_empty() {
            return Ok(None);
        }

        let total_requests = parse_u64(&data, "total_requests");
        let total_time = parse_f64(&data, "total_response_time_ms");

        let mut summary = ServiceUsageSummary {
            service: service.to_string(),
            total_requests,
            total_successes: parse_u64(&data, "total_successes"),
            total_errors: parse_u64(&data, "total_errors"),
            avg_response_time_ms: (total_requests > 0)
                .then(|| total_time / total_requests as f64),
            last_updated: data
                .get("last_updated")
                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
            endpoints: Vec::new(),
        };

        let endpoints_key = format!("{USAGE_KEY_PREFIX}{service}:endpoints");
        for key in self.kv.smembers(&endpoints_key).await? {
            if let Some(endpoint) = self.endpoint_usage(&key).await? {
                summary.endpoints.push(endpoint);
            }
        }
        summary
            .endpoints
            .sort_by(|a, b| b.request_count.cmp(&a.request_count));

        Ok(Some(summary))
    }

    async fn endpoint_usage(&self, key: &str) -> Result<Option<EndpointUsage>, sv_kv::KvError> {
        let data = self.kv.hgetall(key).await?;
        if data.is_empty() {
            return Ok(None);
        }

        let request_count = parse_u64(&data, "request_count");
        let total_time = parse_f64(&data, "total_response_time_ms");

        let status_codes = data
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("status:")
                    .map(|code| (code.to_string(), v.parse().unwrap_or(0)))
            })
            .collect();

        Ok(Some(EndpointUsage {
            endpoint: data.get("endpoint").cloned().unwrap_or_default(),
            method: data.get("method").cloned().unwrap_or_default(),
            service: data.get("service").cloned().unwrap_or_default(),
            request_count,
            success_count: parse_u64(&data, "success_count"),
            error_count: parse_u64(&data, "error_count"),
            total_response_time_ms: total_time,
            avg_response_time_ms: (request_count > 0).then(|| total_time / request_count as f64),
            min_response_time_ms: data
                .get("min_response_time_ms")
                .and_then(|s| s.parse().ok()),
            max_response_time_ms: data
                .get("max_response_time_ms")
                .and_then(|s| s.parse().ok()),
            status_codes,
            first_accessed: data
                .get("first_accessed")
                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
            last_accessed: data
                .get("last_accessed")
                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        }))
    }

    /// Reset statistics for one service, or all of them.
    pub async fn reset_stats(&self, service: Option<&str>) -> Result<(), sv_kv::KvError> {
        let services: Vec<String> = match service {
            Some(name) => vec![name.to_string()],
            None => self.kv.smembers(USAGE_SERVICE_KEY).await?,
        };

        let mut ops = Vec::new();
        for name in &services {
            let endpoints_key = format!("{USAGE_KEY_PREFIX}{name}:endpoints");
            for key in self.kv.smembers(&endpoints_key).await? {
                ops.push(KvOp::Delete { key });
            }
            ops.push(KvOp::Delete { key: endpoints_key });
            ops.push(KvOp::Delete {
                key: format!("{USAGE_KEY_PREFIX}{name}:summary"),
            });
            ops.push(KvOp::Srem {
                key: USAGE_SERVICE_KEY.into(),
                member: name.clone(),
            });
        }
        if service.is_none() {
            ops.push(KvOp::Delete {
                key: USAGE_SERVICE_KEY.into(),
            });
            ops.push(KvOp::Delete {
                key: USAGE_META_KEY.into(),
            });
        }
        self.kv.pipeline(ops).await?;

        info!(service = service.unwrap_or("all"), "usage stats reset");
        Ok(())
    }
}

fn parse_u64(data: &HashMap<String, String>, field: &str) -> u64 {
    data.get(field).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn parse_f64(data: &HashMap<String, String>, field: &str) -> f64 {
    data.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
