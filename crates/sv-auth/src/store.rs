use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use sv_types::{AuthProviderKind, UserRole};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: UserRole,
    /// Absent for users that only ever signed in through an external IdP.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub verified: bool,
    pub active: bool,
    pub timezone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, email: impl Into<String>, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            role,
            password_hash: None,
            verified: false,
            active: true,
            timezone: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Link between a local user and an external identity. Unique per
/// `(provider, provider_user_id)`; at most one link per user per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderLink {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: AuthProviderKind,
    pub provider_user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub status: InviteStatus,
    pub expires_at: DateTime<Utc>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Per-user plan limits, created on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPlanSettings {
    pub user_id: Uuid,
    pub plan_id: String,
    pub owned_networks_limit: i32,
    pub assistant_daily_chat_limit: i32,
}

impl UserPlanSettings {
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            plan_id: "free".into(),
            owned_networks_limit: 3,
            assistant_daily_chat_limit: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// UserStore trait
// ---------------------------------------------------------------------------

/// Relational persistence seam for identities. `PgUserStore` backs
/// production; `MemoryUserStore` backs tests.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Case-insensitive email lookup.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Insert a new user. Fails with [`StoreError::UniqueViolation`] when the
    /// username or email already exists.
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;

    async fn update_user(&self, user: &User) -> Result<(), StoreError>;

    async fn count_users(&self) -> Result<u64, StoreError>;

    // --- provider links ---

    async fn get_link(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<Option<ProviderLink>, StoreError>;

    async fn get_links_for_user(&self, user_id: Uuid) -> Result<Vec<ProviderLink>, StoreError>;

    async fn create_link(&self, link: &ProviderLink) -> Result<(), StoreError>;

    async fn delete_link(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<bool, StoreError>;

    // --- invites ---

    async fn get_invite(&self, id: Uuid) -> Result<Option<Invite>, StoreError>;

    async fn create_invite(&self, invite: &Invite) -> Result<(), StoreError>;

    async fn update_invite(&self, invite: &Invite) -> Result<(), StoreError>;

    // --- plans ---

    /// Fetch the user's plan settings, creating the default row on demand.
    async fn get_or_create_plan(&self, user_id: Uuid) -> Result<UserPlanSettings, StoreError>;
}

// ---------------------------------------------------------------------------
// PgUserStore
// ---------------------------------------------------------------------------

/// Postgres-backed user store.
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<User, StoreError> {
        let role: String = row.try_get("role").map_err(StoreError::from)?;
        Ok(User {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            role: UserRole::parse(&role).unwrap_or(UserRole::Member),
            password_hash: row.try_get("password_hash")?,
            verified: row.try_get("verified")?,
            active: row.try_get("active")?,
            timezone: row.try_get("timezone")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            avatar_url: row.try_get("avatar_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users \
             (id, username, email, role, password_hash, verified, active, timezone, \
              first_name, last_name, avatar_url, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&user.password_hash)
        .bind(user.verified)
        .bind(user.active)
        .bind(&user.timezone)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.avatar_url)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET username = $2, email = $3, role = $4, password_hash = $5, \
             verified = $6, active = $7, timezone = $8, first_name = $9, last_name = $10, \
             avatar_url = $11, updated_at = $12 WHERE id = $1",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&user.password_hash)
        .bind(user.verified)
        .bind(user.active)
        .bind(&user.timezone)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.avatar_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn count_users(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn get_link(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<Option<ProviderLink>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, provider, provider_user_id, created_at \
             FROM provider_links WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider_str(provider))
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_link(&r)).transpose()
    }

    async fn get_links_for_user(&self, user_id: Uuid) -> Result<Vec<ProviderLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, provider, provider_user_id, created_at \
             FROM provider_links WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_link).collect()
    }

    async fn create_link(&self, link: &ProviderLink) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO provider_links (id, user_id, provider, provider_user_id, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(link.id)
        .bind(link.user_id)
        .bind(provider_str(link.provider))
        .bind(&link.provider_user_id)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_link(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM provider_links WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider_str(provider))
        .bind(provider_user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_invite(&self, id: Uuid) -> Result<Option<Invite>, StoreError> {
        let row = sqlx::query(
            "SELECT id, email, role, status, expires_at, created_by, created_at \
             FROM invites WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_invite(&r)).transpose()
    }

    async fn create_invite(&self, invite: &Invite) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO invites (id, email, role, status, expires_at, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(invite.id)
        .bind(&invite.email)
        .bind(invite.role.as_str())
        .bind(invite_status_str(invite.status))
        .bind(invite.expires_at)
        .bind(invite.created_by)
        .bind(invite.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_invite(&self, invite: &Invite) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE invites SET status = $2 WHERE id = $1")
            .bind(invite.id)
            .bind(invite_status_str(invite.status))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_or_create_plan(&self, user_id: Uuid) -> Result<UserPlanSettings, StoreError> {
        let defaults = UserPlanSettings::default_for(user_id);
        let row = sqlx::query(
            "INSERT INTO user_plan_settings \
             (user_id, plan_id, owned_networks_limit, assistant_daily_chat_limit) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id \
             RETURNING user_id, plan_id, owned_networks_limit, assistant_daily_chat_limit",
        )
        .bind(user_id)
        .bind(&defaults.plan_id)
        .bind(defaults.owned_networks_limit)
        .bind(defaults.assistant_daily_chat_limit)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserPlanSettings {
            user_id: row.try_get("user_id")?,
            plan_id: row.try_get("plan_id")?,
            owned_networks_limit: row.try_get("owned_networks_limit")?,
            assistant_daily_chat_limit: row.try_get("assistant_daily_chat_limit")?,
        })
    }
}

fn provider_str(p: AuthProviderKind) -> &'static str {
    match p {
        AuthProviderKind::Local => "local",
        AuthProviderKind::Clerk => "clerk",
        AuthProviderKind::Workos => "workos",
    }
}

fn parse_provider(s: &str) -> AuthProviderKind {
    match s {
        "clerk" => AuthProviderKind::Clerk,
        "workos" => AuthProviderKind::Workos,
        _ => AuthProviderKind::Local,
    }
}

fn invite_status_str(s: InviteStatus) -> &'static str {
    match s {
        InviteStatus::Pending => "pending",
        InviteStatus::Accepted => "accepted",
        InviteStatus::Revoked => "revoked",
        InviteStatus::Expired => "expired",
    }
}

fn row_to_link(row: &sqlx::postgres::PgRow) -> Result<ProviderLink, StoreError> {
    let provider: String = row.try_get("provider")?;
    Ok(ProviderLink {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: parse_provider(&provider),
        provider_user_id: row.try_get("provider_user_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_invite(row: &sqlx::postgres::PgRow) -> Result<Invite, StoreError> {
    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    Ok(Invite {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        role: UserRole::parse(&role).unwrap_or(UserRole::Member),
        status: match status.as_str() {
            "accepted" => InviteStatus::Accepted,
            "revoked" => InviteStatus::Revoked,
            "expired" => InviteStatus::Expired,
            _ => InviteStatus::Pending,
        },
        expires_at: row.try_get("expires_at")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// MemoryUserStore
// ---------------------------------------------------------------------------

/// In-memory [`UserStore`] for tests. The interior mutex makes every
/// operation atomic, which mirrors the uniqueness guarantees the relational
/// store provides.
#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<Uuid, User>,
    links: Vec<ProviderLink>,
    invites: HashMap<Uuid, Invite>,
    plans: HashMap<Uuid, UserPlanSettings>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.values().find(|u| u.username == username).cloned())
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::UniqueViolation(format!(
                "username {}",
                user.username
            )));
        }
        if inner
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::UniqueViolation(format!("email {}", user.email)));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(&user.id) {
            return Err(StoreError::NotFound);
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn count_users(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().users.len() as u64)
    }

    async fn get_link(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<Option<ProviderLink>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .links
            .iter()
            .find(|l| l.provider == provider && l.provider_user_id == provider_user_id)
            .cloned())
    }

    async fn get_links_for_user(&self, user_id: Uuid) -> Result<Vec<ProviderLink>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .links
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_link(&self, link: &ProviderLink) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .links
            .iter()
            .any(|l| l.provider == link.provider && l.provider_user_id == link.provider_user_id)
        {
            return Err(StoreError::UniqueViolation("provider link".into()));
        }
        inner.links.push(link.clone());
        Ok(())
    }

    async fn delete_link(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.links.len();
        inner
            .links
            .retain(|l| !(l.provider == provider && l.provider_user_id == provider_user_id));
        Ok(inner.links.len() < before)
    }

    async fn get_invite(&self, id: Uuid) -> Result<Option<Invite>, StoreError> {
        Ok(self.inner.lock().unwrap().invites.get(&id).cloned())
    }

    async fn create_invite(&self, invite: &Invite) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .invites
            .insert(invite.id, invite.clone());
        Ok(())
    }

    async fn update_invite(&self, invite: &Invite) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.invites.contains_key(&invite.id) {
            return Err(StoreError::NotFound);
        }
        inner.invites.insert(invite.id, invite.clone());
        Ok(())
    }

    async fn get_or_create_plan(&self, user_id: Uuid) -> Result<UserPlanSettings, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .plans
            .entry(user_id)
            .or_insert_with(|| UserPlanSettings::default_for(user_id))
            .clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn email_lookup_is_case_insensitive() {
        let store = MemoryUserStore::new();
        let user = User::new("alice", "Alice@Example.com", UserRole::Member);
        store.create_user(&user).await.unwrap();

        let found = store.get_user_by_email("alice@example.COM").await.unwrap();
        assert_eq!(found.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn duplicate_username_is_unique_violation() {
        let store = MemoryUserStore::new();
        store
            .create_user(&User::new("bob", "bob@example.com", UserRole::Member))
            .await
            .unwrap();
        let err = store
            .create_user(&User::new("bob", "other@example.com", UserRole::Member))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn duplicate_provider_link_is_rejected() {
        let store = MemoryUserStore::new();
        let link = ProviderLink {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: AuthProviderKind::Clerk,
            provider_user_id: "user_1".into(),
            created_at: Utc::now(),
        };
        store.create_link(&link).await.unwrap();

        let duplicate = ProviderLink {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            ..link.clone()
        };
        assert!(matches!(
            store.create_link(&duplicate).await.unwrap_err(),
            StoreError::UniqueViolation(_)
        ));
    }

    #[tokio::test]
    async fn plan_is_created_on_demand_and_stable() {
        let store = MemoryUserStore::new();
        let user_id = Uuid::new_v4();
        let first = store.get_or_create_plan(user_id).await.unwrap();
        let second = store.get_or_create_plan(user_id).await.unwrap();
        assert_eq!(first.plan_id, second.plan_id);
        assert_eq!(first.assistant_daily_chat_limit, 50);
    }
}
