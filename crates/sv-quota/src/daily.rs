use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde::Serialize;
use sv_auth::ApiError;
use sv_kv::Kv;
use thiserror::Error;
use tracing::{debug, warn};

use crate::limits::{LimitPolicy, RateLimitStore, UserRateLimitRow};

/// Sentinel for "no daily cap" in resolved numeric limits and status
/// payloads.
pub const UNLIMITED: i64 = -1;

// ---------------------------------------------------------------------------
// Errors / status
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QuotaError {
    /// The caller used up today's quota. `retry_after` is the remaining TTL
    /// of the day key.
    #[error("Daily limit exceeded for this endpoint ({limit}/day). Try again tomorrow.")]
    Exceeded { limit: i64, retry_after: u64 },

    #[error(transparent)]
    Kv(#[from] sv_kv::KvError),
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded { retry_after, .. } => ApiError::RateLimited {
                detail: err.to_string(),
                retry_after,
            },
            QuotaError::Kv(e) => ApiError::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub resets_in_seconds: u64,
    pub is_exempt: bool,
}

// ---------------------------------------------------------------------------
// Day arithmetic
// ---------------------------------------------------------------------------

/// Today's UTC calendar date, the partition key for daily counters.
fn utc_date() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Seconds until the next UTC midnight, floored at 1 so a key set in the
/// last instant of the day still expires.
fn seconds_until_utc_midnight() -> u64 {
    let now = Utc::now();
    let tomorrow = (now + Duration::days(1)).date_naive();
    let midnight = Utc
        .from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight"));
    (midnight - now).num_seconds().max(1) as u64
}

// ---------------------------------------------------------------------------
// QuotaEngine
// ---------------------------------------------------------------------------

/// Calendar-day quota enforcement.
///
/// Counters live in the KV store so every process sees the same numbers;
/// the increment is a single server-side atomic operation, so a burst of
/// concurrent callers still gets exactly `limit` admissions per day.
pub struct QuotaEngine {
    kv: Arc<dyn Kv>,
    store: Option<Arc<dyn RateLimitStore>>,
    service: String,
    exempt_roles: HashSet<String>,
}

impl QuotaEngine {
    pub fn new(
        kv: Arc<dyn Kv>,
        store: Option<Arc<dyn RateLimitStore>>,
        service: impl Into<String>,
        exempt_roles: HashSet<String>,
    ) -> Self {
        Self {
            kv,
            store,
            service: service.into(),
            exempt_roles,
        }
    }

    fn day_key(&self, user_id: &str, endpoint: &str) -> String {
        format!("rl:{}:{}:{}:{}", self.service, user_id, endpoint, utc_date())
    }

    pub fn is_role_exempt(&self, role: &str) -> bool {
        self.exempt_roles.contains(&role.to_ascii_lowercase())
    }

    /// Resolve the user's effective daily limit ([`UNLIMITED`] for no cap).
    ///
    /// Exempt roles win outright and the override row is refreshed to record
    /// the exemption. A stored role exemption whose role no longer qualifies
    /// is reverted to the default. Store failures fall back to the
    /// role-based decision.
    pub async fn resolve_limit(&self, user_id: &str, role: &str, default_limit: i64) -> i64 {
        let exempt = self.is_role_exempt(role);

        let Some(store) = self.store.as_ref() else {
            return if exempt { UNLIMITED } else { default_limit };
        };

        if exempt {
            let row = UserRateLimitRow {
                user_id: user_id.to_string(),
                daily_limit: Some(UNLIMITED),
                is_role_exempt: true,
                updated_at: Utc::now(),
            };
            if let Err(e) = store.upsert(&row).await {
                warn!(user_id, error = %e, "failed to refresh role exemption");
            }
            return UNLIMITED;
        }

        match store.get(user_id).await {
            Ok(Some(row)) => match row.policy() {
                LimitPolicy::Default => default_limit,
                LimitPolicy::Custom(k) => k,
                LimitPolicy::Unlimited if row.is_role_exempt => {
                    // Role exemption outlived the role; revert to default.
                    let reverted = UserRateLimitRow {
                        user_id: user_id.to_string(),
                        daily_limit: None,
                        is_role_exempt: false,
                        updated_at: Utc::now(),
                    };
                    if let Err(e) = store.upsert(&reverted).await {
                        warn!(user_id, error = %e, "failed to revert stale exemption");
                    }
                    debug!(user_id, "reverted stale role exemption to default");
                    default_limit
                }
                // A manual unlimited grant stands regardless of role.
                LimitPolicy::Unlimited => UNLIMITED,
            },
            Ok(None) => default_limit,
            Err(e) => {
                warn!(user_id, error = %e, "limit store unavailable, using role decision");
                if exempt {
                    UNLIMITED
                } else {
                    default_limit
                }
            }
        }
    }

    /// Enforce the daily quota for one call. Unlimited users pass without an
    /// increment; everyone else consumes one atomic count.
    pub async fn check(
        &self,
        user_id: &str,
        endpoint: &str,
        default_limit: i64,
        role: &str,
    ) -> Result<(), QuotaError> {
        let limit = self.resolve_limit(user_id, role, default_limit).await;
        if limit == UNLIMITED {
            return Ok(());
        }

        let key = self.day_key(user_id, endpoint);
        let ttl = seconds_until_utc_midnight();
        let count = self.kv.incr_with_ttl(&key, ttl).await?;

        if count > limit {
            debug!(user_id, endpoint, count, limit, "daily quota exceeded");
            return Err(QuotaError::Exceeded {
                limit,
                retry_after: ttl,
            });
        }
        Ok(())
    }

    /// Current quota status without consuming a count.
    pub async fn status(
        &self,
        user_id: &str,
        endpoint: &str,
        default_limit: i64,
        role: &str,
    ) -> Result<QuotaStatus, QuotaError> {
        let limit = self.resolve_limit(user_id, role, default_limit).await;
        if limit == UNLIMITED {
            return Ok(QuotaStatus {
                used: 0,
                limit: UNLIMITED,
                remaining: UNLIMITED,
                resets_in_seconds: seconds_until_utc_midnight(),
                is_exempt: true,
            });
        }

        let key = self.day_key(user_id, endpoint);
        let used = self
            .kv
            .get(&key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(QuotaStatus {
            used,
            limit,
            remaining: (limit - used).max(0),
            resets_in_seconds: seconds_until_utc_midnight(),
            is_exempt: false,
        })
    }

    /// Administrative upsert of a user's policy.
    pub async fn set_user_limit(&self, user_id: &str, policy: LimitPolicy) -> Result<(), ApiError> {
        let Some(store) = self.store.as_ref() else {
            return Err(ApiError::Internal("rate limit store not configured".into()));
        };
        let row = UserRateLimitRow {
            user_id: user_id.to_string(),
            daily_limit: policy.to_column(),
            is_role_exempt: false,
            updated_at: Utc::now(),
        };
        store
            .upsert(&row)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Administrative reset back to the system default.
    pub async fn reset_user_to_default(&self, user_id: &str) -> Result<(), ApiError> {
        self.set_user_limit(user_id, LimitPolicy::Default).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::MemoryRateLimitStore;
    use sv_kv::MemoryKv;

    fn engine(store: Option<Arc<dyn RateLimitStore>>) -> (Arc<MemoryKv>, QuotaEngine) {
        let kv = Arc::new(MemoryKv::new());
        let exempt: HashSet<String> = ["owner".to_string(), "admin".to_string()].into();
        (
            kv.clone(),
            QuotaEngine::new(kv, store, "assistant", exempt),
        )
    }

    #[test]
    fn midnight_ttl_is_sane() {
        let ttl = seconds_until_utc_midnight();
        assert!(ttl >= 1);
        assert!(ttl <= 86_400);
    }

    #[tokio::test]
    async fn exactly_limit_calls_succeed() {
        let (_kv, engine) = engine(None);
        for _ in 0..5 {
            engine.check("u1", "chat", 5, "member").await.unwrap();
        }
        let err = engine.check("u1", "chat", 5, "member").await.unwrap_err();
        match err {
            QuotaError::Exceeded { limit, retry_after } => {
                assert_eq!(limit, 5);
                assert!(retry_after > 0);
                assert!(retry_after <= 86_400);
            }
            other => panic!("expected exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_budget() {
        let store: Option<Arc<dyn RateLimitStore>> = None;
        let (_kv, engine) = engine(store);
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.check("u1", "chat", 5, "member").await.is_ok()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn unlimited_user_never_increments() {
        let (kv, engine) = engine(None);
        for _ in 0..50 {
            engine.check("boss", "chat", 5, "owner").await.unwrap();
        }
        // No counter key was ever created.
        let key = engine.day_key("boss", "chat");
        assert_eq!(kv.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn exempt_role_persists_exemption_row() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let (_kv, engine) = engine(Some(store.clone()));

        assert_eq!(engine.resolve_limit("boss", "ADMIN", 100).await, UNLIMITED);

        let row = store.get("boss").await.unwrap().unwrap();
        assert_eq!(row.daily_limit, Some(-1));
        assert!(row.is_role_exempt);
    }

    #[tokio::test]
    async fn stale_role_exemption_reverts_to_default() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let (_kv, engine) = engine(Some(store.clone()));

        // Was exempt while admin.
        engine.resolve_limit("demoted", "admin", 100).await;
        // Role dropped to member: revert and return the default.
        assert_eq!(engine.resolve_limit("demoted", "member", 100).await, 100);

        let row = store.get("demoted").await.unwrap().unwrap();
        assert_eq!(row.daily_limit, None);
        assert!(!row.is_role_exempt);
    }

    #[tokio::test]
    async fn manual_unlimited_grant_survives_role_change() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let (_kv, engine) = engine(Some(store.clone()));

        engine
            .set_user_limit("vip", LimitPolicy::Unlimited)
            .await
            .unwrap();
        assert_eq!(engine.resolve_limit("vip", "member", 100).await, UNLIMITED);
    }

    #[tokio::test]
    async fn custom_limit_applies() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let (_kv, engine) = engine(Some(store.clone()));

        engine
            .set_user_limit("u1", LimitPolicy::Custom(2))
            .await
            .unwrap();

        engine.check("u1", "chat", 100, "member").await.unwrap();
        engine.check("u1", "chat", 100, "member").await.unwrap();
        assert!(engine.check("u1", "chat", 100, "member").await.is_err());
    }

    #[tokio::test]
    async fn reset_returns_user_to_default() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let (_kv, engine) = engine(Some(store.clone()));

        engine
            .set_user_limit("u1", LimitPolicy::Custom(2))
            .await
            .unwrap();
        engine.reset_user_to_default("u1").await.unwrap();

        assert_eq!(engine.resolve_limit("u1", "member", 100).await, 100);
        let row = store.get("u1").await.unwrap().unwrap();
        assert_eq!(row.policy(), LimitPolicy::Default);
    }

    #[tokio::test]
    async fn status_reports_usage_and_reset() {
        let (_kv, engine) = engine(None);
        engine.check("u1", "chat", 5, "member").await.unwrap();
        engine.check("u1", "chat", 5, "member").await.unwrap();

        let status = engine.status("u1", "chat", 5, "member").await.unwrap();
        assert_eq!(status.used, 2);
        assert_eq!(status.limit, 5);
        assert_eq!(status.remaining, 3);
        assert!(status.resets_in_seconds > 0);
        assert!(!status.is_exempt);
    }

    #[tokio::test]
    async fn exempt_status_is_unlimited() {
        let (_kv, engine) = engine(None);
        let status = engine.status("boss", "chat", 5, "owner").await.unwrap();
        assert_eq!(status.limit, UNLIMITED);
        assert_eq!(status.remaining, UNLIMITED);
        assert!(status.is_exempt);
    }

    #[tokio::test]
    async fn quota_error_maps_to_429_with_retry_after() {
        let err = QuotaError::Exceeded {
            limit: 5,
            retry_after: 1234,
        };
        let api: ApiError = err.into();
        match api {
            ApiError::RateLimited {
                detail,
                retry_after,
            } => {
                assert!(detail.contains("5/day"));
                assert_eq!(retry_after, 1234);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
