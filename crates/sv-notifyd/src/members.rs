use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MemberError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected backend response: {0}")]
    Unexpected(String),
}

// ---------------------------------------------------------------------------
// NetworkMembers trait
// ---------------------------------------------------------------------------

/// Seam to the backend for recipient enumeration: a network's members are
/// its owner plus everyone holding a permission row.
#[async_trait]
pub trait NetworkMembers: Send + Sync {
    /// Owner first, then permission holders.
    async fn member_user_ids(&self, network_id: &str) -> Result<Vec<String>, MemberError>;

    /// Every known network id.
    async fn all_network_ids(&self) -> Result<Vec<String>, MemberError>;

    /// network id -> owner user id, for preference migration.
    async fn network_owners(&self) -> Result<HashMap<String, String>, MemberError>;
}

// ---------------------------------------------------------------------------
// HttpNetworkMembers
// ---------------------------------------------------------------------------

/// Backend-backed implementation using the shared service token.
pub struct HttpNetworkMembers {
    http: reqwest::Client,
    backend_url: String,
    service_token: String,
}

impl HttpNetworkMembers {
    pub fn new(backend_url: impl Into<String>, service_token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            backend_url: backend_url.into(),
            service_token: service_token.into(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, MemberError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.service_token)
            .send()
            .await
            .map_err(|e| MemberError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MemberError::Unexpected(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| MemberError::Unexpected(e.to_string()))
    }
}

#[async_trait]
impl NetworkMembers for HttpNetworkMembers {
    async fn member_user_ids(&self, network_id: &str) -> Result<Vec<String>, MemberError> {
        let url = format!("{}/api/networks/{network_id}/members", self.backend_url);
        let body = self.get_json(&url).await?;
        let members = body
            .as_array()
            .ok_or_else(|| MemberError::Unexpected("members payload not a list".into()))?;
        Ok(members
            .iter()
            .filter_map(|m| m.get("user_id").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn all_network_ids(&self) -> Result<Vec<String>, MemberError> {
        let url = format!("{}/api/networks", self.backend_url);
        let body = self.get_json(&url).await?;
        Ok(body
            .as_array()
            .map(|networks| {
                networks
                    .iter()
                    .filter_map(|n| n.get("id").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_else(|| {
                warn!("networks payload not a list");
                Vec::new()
            }))
    }

    async fn network_owners(&self) -> Result<HashMap<String, String>, MemberError> {
        let url = format!("{}/api/networks", self.backend_url);
        let body = self.get_json(&url).await?;
        Ok(body
            .as_array()
            .map(|networks| {
                networks
                    .iter()
                    .filter_map(|n| {
                        let id = n.get("id").and_then(Value::as_str)?;
                        let owner = n.get("owner_user_id").and_then(Value::as_str)?;
                        Some((id.to_string(), owner.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryNetworkMembers
// ---------------------------------------------------------------------------

/// In-memory implementation for tests.
#[derive(Default)]
pub struct MemoryNetworkMembers {
    networks: Mutex<HashMap<String, (String, Vec<String>)>>, // id -> (owner, members)
    fail: Mutex<bool>,
}

impl MemoryNetworkMembers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_network(&self, network_id: &str, owner: &str, others: &[&str]) {
        let mut members = vec![owner.to_string()];
        members.extend(others.iter().map(|s| s.to_string()));
        self.networks
            .lock()
            .unwrap()
            .insert(network_id.to_string(), (owner.to_string(), members));
    }

    /// Make every call fail, to exercise failure transitions.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }

    fn check(&self) -> Result<(), MemberError> {
        if *self.fail.lock().unwrap() {
            Err(MemberError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NetworkMembers for MemoryNetworkMembers {
    async fn member_user_ids(&self, network_id: &str) -> Result<Vec<String>, MemberError> {
        self.check()?;
        Ok(self
            .networks
            .lock()
            .unwrap()
            .get(network_id)
            .map(|(_, members)| members.clone())
            .unwrap_or_default())
    }

    async fn all_network_ids(&self) -> Result<Vec<String>, MemberError> {
        self.check()?;
        Ok(self.networks.lock().unwrap().keys().cloned().collect())
    }

    async fn network_owners(&self) -> Result<HashMap<String, String>, MemberError> {
        self.check()?;
        Ok(self
            .networks
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (owner, _))| (id.clone(), owner.clone()))
            .collect())
    }
}
