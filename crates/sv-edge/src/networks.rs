use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A tenant: one topology with its own nodes, permissions, and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: Uuid,
    pub owner_user_id: String,
    pub name: String,
    pub description: Option<String>,
    /// 64-hex shared secret the on-site agent authenticates with.
    #[serde(skip_serializing)]
    pub agent_key: String,
    #[serde(default)]
    pub layout_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Network {
    pub fn new(owner_user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_user_id: owner_user_id.into(),
            name: name.into(),
            description: None,
            agent_key: generate_agent_key(),
            layout_data: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A fresh 64-hex agent secret.
pub fn generate_agent_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionRole {
    Viewer,
    Editor,
}

impl PermissionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionRole::Viewer => "viewer",
            PermissionRole::Editor => "editor",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "editor" {
            PermissionRole::Editor
        } else {
            PermissionRole::Viewer
        }
    }
}

/// Grant of access to a network. At most one row per (network, user);
/// owners are implicit and never hold a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPermission {
    pub network_id: Uuid,
    pub user_id: String,
    pub role: PermissionRole,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NetworkStoreError {
    #[error("not found")]
    NotFound,
    #[error("duplicate permission")]
    DuplicatePermission,
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for NetworkStoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => NetworkStoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                NetworkStoreError::DuplicatePermission
            }
            _ => NetworkStoreError::Database(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NetworkStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Network>, NetworkStoreError>;

    /// Networks the user owns or holds a permission on.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Network>, NetworkStoreError>;

    async fn list_all(&self) -> Result<Vec<Network>, NetworkStoreError>;

    async fn create(&self, network: &Network) -> Result<(), NetworkStoreError>;

    async fn update(&self, network: &Network) -> Result<(), NetworkStoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, NetworkStoreError>;

    async fn permissions(&self, network_id: Uuid)
        -> Result<Vec<NetworkPermission>, NetworkStoreError>;

    async fn get_permission(
        &self,
        network_id: Uuid,
        user_id: &str,
    ) -> Result<Option<NetworkPermission>, NetworkStoreError>;

    /// Fails with [`NetworkStoreError::DuplicatePermission`] when the pair
    /// already has a row.
    async fn grant(&self, permission: &NetworkPermission) -> Result<(), NetworkStoreError>;

    async fn revoke(&self, network_id: Uuid, user_id: &str) -> Result<bool, NetworkStoreError>;
}

/// Owner first, then permission holders.
pub async fn member_user_ids(
    store: &dyn NetworkStore,
    network: &Network,
) -> Result<Vec<String>, NetworkStoreError> {
    let mut members = vec![network.owner_user_id.clone()];
    for permission in store.permissions(network.id).await? {
        if !members.contains(&permission.user_id) {
            members.push(permission.user_id);
        }
    }
    Ok(members)
}

// ---------------------------------------------------------------------------
// PgNetworkStore
// ---------------------------------------------------------------------------

pub struct PgNetworkStore {
    pool: PgPool,
}

impl PgNetworkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_network(row: &sqlx::postgres::PgRow) -> Result<Network, NetworkStoreError> {
        let layout: Option<Value> = row.try_get("layout_data")?;
        Ok(Network {
            id: row.try_get("id")?,
            owner_user_id: row.try_get("owner_user_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            agent_key: row.try_get("agent_key")?,
            layout_data: layout,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl NetworkStore for PgNetworkStore {
    async fn get(&self, id: Uuid) -> Result<Option<Network>, NetworkStoreError> {
        let row = sqlx::query("SELECT * FROM networks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_network).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Network>, NetworkStoreError> {
        let rows = sqlx::query(
            "SELECT n.* FROM networks n \
             LEFT JOIN network_permissions p ON p.network_id = n.id AND p.user_id = $1 \
             WHERE n.owner_user_id = $1 OR p.user_id IS NOT NULL \
             ORDER BY n.created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_network).collect()
    }

    async fn list_all(&self) -> Result<Vec<Network>, NetworkStoreError> {
        let rows = sqlx::query("SELECT * FROM networks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_network).collect()
    }

    async fn create(&self, network: &Network) -> Result<(), NetworkStoreError> {
        sqlx::query(
            "INSERT INTO networks \
             (id, owner_user_id, name, description, agent_key, layout_data, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(network.id)
        .bind(&network.owner_user_id)
        .bind(&network.name)
        .bind(&network.description)
        .bind(&network.agent_key)
        .bind(&network.layout_data)
        .bind(network.created_at)
        .bind(network.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, network: &Network) -> Result<(), NetworkStoreError> {
        let result = sqlx::query(
            "UPDATE networks SET name = $2, description = $3, layout_data = $4, updated_at = $5 \
             WHERE id = $1",
        )
        .bind(network.id)
        .bind(&network.name)
        .bind(&network.description)
        .bind(&network.layout_data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(NetworkStoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, NetworkStoreError> {
        sqlx::query("DELETE FROM network_permissions WHERE network_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM networks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn permissions(
        &self,
        network_id: Uuid,
    ) -> Result<Vec<NetworkPermission>, NetworkStoreError> {
        let rows = sqlx::query(
            "SELECT network_id, user_id, role, created_at \
             FROM network_permissions WHERE network_id = $1",
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role")?;
                Ok(NetworkPermission {
                    network_id: row.try_get("network_id")?,
                    user_id: row.try_get("user_id")?,
                    role: PermissionRole::parse(&role),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_permission(
        &self,
        network_id: Uuid,
        user_id: &str,
    ) -> Result<Option<NetworkPermission>, NetworkStoreError> {
        let row = sqlx::query(
            "SELECT network_id, user_id, role, created_at \
             FROM network_permissions WHERE network_id = $1 AND user_id = $2",
        )
        .bind(network_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let role: String = row.try_get("role")?;
            Ok(NetworkPermission {
                network_id: row.try_get("network_id")?,
                user_id: row.try_get("user_id")?,
                role: PermissionRole::parse(&role),
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn grant(&self, permission: &NetworkPermission) -> Result<(), NetworkStoreError> {
        sqlx::query(
            "INSERT INTO network_permissions (network_id, user_id, role, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(permission.network_id)
        .bind(&permission.user_id)
        .bind(permission.role.as_str())
        .bind(permission.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, network_id: Uuid, user_id: &str) -> Result<bool, NetworkStoreError> {
        let result =
            sqlx::query("DELETE FROM network_permissions WHERE network_id = $1 AND user_id = $2")
                .bind(network_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// MemoryNetworkStore
// ---------------------------------------------------------------------------

/// In-memory [`NetworkStore`] for tests.
#[derive(Default)]
pub struct MemoryNetworkStore {
    networks: Mutex<HashMap<Uuid, Network>>,
    permissions: Mutex<Vec<NetworkPermission>>,
}

impl MemoryNetworkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NetworkStore for MemoryNetworkStore {
    async fn get(&self, id: Uuid) -> Result<Option<Network>, NetworkStoreError> {
        Ok(self.networks.lock().unwrap().get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Network>, NetworkStoreError> {
        let permissions = self.permissions.lock().unwrap();
        let permitted: Vec<Uuid> = permissions
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.network_id)
            .collect();
        let networks = self.networks.lock().unwrap();
        let mut out: Vec<Network> = networks
            .values()
            .filter(|n| n.owner_user_id == user_id || permitted.contains(&n.id))
            .cloned()
            .collect();
        out.sort_by_key(|n| n.created_at);
        Ok(out)
    }

    async fn list_all(&self) -> Result<Vec<Network>, NetworkStoreError> {
        let networks = self.networks.lock().unwrap();
        let mut out: Vec<Network> = networks.values().cloned().collect();
        out.sort_by_key(|n| n.created_at);
        Ok(out)
    }

    async fn create(&self, network: &Network) -> Result<(), NetworkStoreError> {
        self.networks
            .lock()
            .unwrap()
            .insert(network.id, network.clone());
        Ok(())
    }

    async fn update(&self, network: &Network) -> Result<(), NetworkStoreError> {
        let mut networks = self.networks.lock().unwrap();
        if !networks.contains_key(&network.id) {
            return Err(NetworkStoreError::NotFound);
        }
        networks.insert(network.id, network.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, NetworkStoreError> {
        self.permissions
            .lock()
            .unwrap()
            .retain(|p| p.network_id != id);
        Ok(self.networks.lock().unwrap().remove(&id).is_some())
    }

    async fn permissions(
        &self,
        network_id: Uuid,
    ) -> Result<Vec<NetworkPermission>, NetworkStoreError> {
        Ok(self
            .permissions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn get_permission(
        &self,
        network_id: Uuid,
        user_id: &str,
    ) -> Result<Option<NetworkPermission>, NetworkStoreError> {
        Ok(self
            .permissions
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.network_id == network_id && p.user_id == user_id)
            .cloned())
    }

    async fn grant(&self, permission: &NetworkPermission) -> Result<(), NetworkStoreError> {
        let mut permissions = self.permissions.lock().unwrap();
        if permissions
            .iter()
            .any(|p| p.network_id == permission.network_id && p.user_id == permission.user_id)
        {
            return Err(NetworkStoreError::DuplicatePermission);
        }
        permissions.push(permission.clone());
        Ok(())
    }

    async fn revoke(&self, network_id: Uuid, user_id: &str) -> Result<bool, NetworkStoreError> {
        let mut permissions = self.permissions.lock().unwrap();
        let before = permissions.len();
        permissions.retain(|p| !(p.network_id == network_id && p.user_id == user_id));
        Ok(permissions.len() < before)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_key_is_64_hex() {
        let key = generate_agent_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, generate_agent_key());
    }

    #[test]
    fn agent_key_is_never_serialized() {
        let network = Network::new("u1", "Home");
        let json = serde_json::to_string(&network).unwrap();
        assert!(!json.contains(&network.agent_key));
    }

    #[tokio::test]
    async fn list_for_user_includes_owned_and_permitted() {
        let store = MemoryNetworkStore::new();
        let mine = Network::new("u1", "Mine");
        let shared = Network::new("u2", "Shared");
        let other = Network::new("u3", "Other");
        store.create(&mine).await.unwrap();
        store.create(&shared).await.unwrap();
        store.create(&other).await.unwrap();

        store
            .grant(&NetworkPermission {
                network_id: shared.id,
                user_id: "u1".into(),
                role: PermissionRole::Viewer,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let visible = store.list_for_user("u1").await.unwrap();
        let names: Vec<_> = visible.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"Mine"));
        assert!(names.contains(&"Shared"));
        assert!(!names.contains(&"Other"));
    }

    #[tokio::test]
    async fn duplicate_grant_is_rejected() {
        let store = MemoryNetworkStore::new();
        let network = Network::new("u1", "Home");
        store.create(&network).await.unwrap();

        let permission = NetworkPermission {
            network_id: network.id,
            user_id: "u2".into(),
            role: PermissionRole::Viewer,
            created_at: Utc::now(),
        };
        store.grant(&permission).await.unwrap();
        assert!(matches!(
            store.grant(&permission).await.unwrap_err(),
            NetworkStoreError::DuplicatePermission
        ));
    }

    #[tokio::test]
    async fn members_are_owner_plus_holders() {
        let store = MemoryNetworkStore::new();
        let network = Network::new("owner-1", "Home");
        store.create(&network).await.unwrap();
        store
            .grant(&NetworkPermission {
                network_id: network.id,
                user_id: "viewer-1".into(),
                role: PermissionRole::Viewer,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let members = member_user_ids(&store, &network).await.unwrap();
        assert_eq!(members, vec!["owner-1".to_string(), "viewer-1".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_permissions() {
        let store = MemoryNetworkStore::new();
        let network = Network::new("u1", "Home");
        store.create(&network).await.unwrap();
        store
            .grant(&NetworkPermission {
                network_id: network.id,
                user_id: "u2".into(),
                role: PermissionRole::Editor,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete(network.id).await.unwrap());
        assert!(store.permissions(network.id).await.unwrap().is_empty());
        assert!(!store.delete(network.id).await.unwrap());
    }
}
