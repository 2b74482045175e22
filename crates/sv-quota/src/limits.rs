use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;

// ---------------------------------------------------------------------------
// LimitPolicy
// ---------------------------------------------------------------------------

/// A user's daily-limit policy. The persisted column encodes this as
/// NULL / −1 / k, but the tri-state is explicit everywhere above the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "limit")]
pub enum LimitPolicy {
    /// Use the system default for the endpoint.
    Default,
    /// No daily cap.
    Unlimited,
    /// A specific daily count (>= 1).
    Custom(i64),
}

impl LimitPolicy {
    /// Decode the persisted NULL / −1 / k encoding.
    pub fn from_column(daily_limit: Option<i64>) -> Self {
        match daily_limit {
            None => LimitPolicy::Default,
            Some(-1) => LimitPolicy::Unlimited,
            Some(k) => LimitPolicy::Custom(k),
        }
    }

    /// Encode back to the persisted column value.
    pub fn to_column(self) -> Option<i64> {
        match self {
            LimitPolicy::Default => None,
            LimitPolicy::Unlimited => Some(-1),
            LimitPolicy::Custom(k) => Some(k),
        }
    }

    /// Resolve to a concrete numeric limit; −1 means unlimited.
    pub fn effective(self, default_limit: i64) -> i64 {
        match self {
            LimitPolicy::Default => default_limit,
            LimitPolicy::Unlimited => -1,
            LimitPolicy::Custom(k) => k,
        }
    }
}

// ---------------------------------------------------------------------------
// UserRateLimitRow
// ---------------------------------------------------------------------------

/// Per-user override row. `is_role_exempt` records that the current
/// unlimited policy came from a role exemption rather than a manual grant,
/// so it can be reverted when the role stops qualifying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRateLimitRow {
    pub user_id: String,
    pub daily_limit: Option<i64>,
    pub is_role_exempt: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserRateLimitRow {
    pub fn policy(&self) -> LimitPolicy {
        LimitPolicy::from_column(self.daily_limit)
    }
}

// ---------------------------------------------------------------------------
// RateLimitStore
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LimitStoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for LimitStoreError {
    fn from(err: sqlx::Error) -> Self {
        LimitStoreError::Database(err.to_string())
    }
}

/// Persistence seam for per-user overrides.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserRateLimitRow>, LimitStoreError>;
    async fn upsert(&self, row: &UserRateLimitRow) -> Result<(), LimitStoreError>;
}

// ---------------------------------------------------------------------------
// PgRateLimitStore
// ---------------------------------------------------------------------------

pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserRateLimitRow>, LimitStoreError> {
        let row = sqlx::query(
            "SELECT user_id, daily_limit, is_role_exempt, updated_at \
             FROM user_rate_limits WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(UserRateLimitRow {
                user_id: r.try_get("user_id")?,
                daily_limit: r.try_get("daily_limit")?,
                is_role_exempt: r.try_get("is_role_exempt")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(|e: sqlx::Error| e.into())
    }

    async fn upsert(&self, row: &UserRateLimitRow) -> Result<(), LimitStoreError> {
        sqlx::query(
            "INSERT INTO user_rate_limits (user_id, daily_limit, is_role_exempt, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO UPDATE SET \
               daily_limit = EXCLUDED.daily_limit, \
               is_role_exempt = EXCLUDED.is_role_exempt, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(&row.user_id)
        .bind(row.daily_limit)
        .bind(row.is_role_exempt)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRateLimitStore
// ---------------------------------------------------------------------------

/// In-memory [`RateLimitStore`] for tests.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    rows: Mutex<HashMap<String, UserRateLimitRow>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserRateLimitRow>, LimitStoreError> {
        Ok(self.rows.lock().unwrap().get(user_id).cloned())
    }

    async fn upsert(&self, row: &UserRateLimitRow) -> Result<(), LimitStoreError> {
        self.rows
            .lock()
            .unwrap()
            .insert(row.user_id.clone(), row.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_column_encoding_round_trips() {
        for policy in [
            LimitPolicy::Default,
            LimitPolicy::Unlimited,
            LimitPolicy::Custom(25),
        ] {
            assert_eq!(LimitPolicy::from_column(policy.to_column()), policy);
        }
    }

    #[test]
    fn null_minus_one_and_custom_stay_distinct() {
        assert_eq!(LimitPolicy::from_column(None), LimitPolicy::Default);
        assert_eq!(LimitPolicy::from_column(Some(-1)), LimitPolicy::Unlimited);
        assert_eq!(LimitPolicy::from_column(Some(7)), LimitPolicy::Custom(7));
    }

    #[test]
    fn effective_limit_resolution() {
        assert_eq!(LimitPolicy::Default.effective(100), 100);
        assert_eq!(LimitPolicy::Unlimited.effective(100), -1);
        assert_eq!(LimitPolicy::Custom(5).effective(100), 5);
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryRateLimitStore::new();
        assert!(store.get("u1").await.unwrap().is_none());

        let row = UserRateLimitRow {
            user_id: "u1".into(),
            daily_limit: Some(-1),
            is_role_exempt: true,
            updated_at: Utc::now(),
        };
        store.upsert(&row).await.unwrap();

        let loaded = store.get("u1").await.unwrap().unwrap();
        assert_eq!(loaded.policy(), LimitPolicy::Unlimited);
        assert!(loaded.is_role_exempt);
    }
}
