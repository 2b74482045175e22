use std::sync::Arc;

use chrono::Utc;
use sv_types::{AuthProviderKind, IdentityClaims, UserRole};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{ProviderLink, StoreError, User, UserStore};

/// How many `-2`, `-3`, ... suffixes to try before falling back to a random
/// username suffix.
const MAX_USERNAME_ATTEMPTS: u32 = 50;

// ---------------------------------------------------------------------------
// SyncOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub user_id: Option<Uuid>,
    pub created: bool,
    pub updated: bool,
}

impl SyncOutcome {
    fn none() -> Self {
        Self {
            user_id: None,
            created: false,
            updated: false,
        }
    }
}

// ---------------------------------------------------------------------------
// IdentitySync
// ---------------------------------------------------------------------------

/// Reconciles verified external identities with local users.
pub struct IdentitySync {
    store: Arc<dyn UserStore>,
}

impl IdentitySync {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Resolve (or create) the local user for a verified identity.
    ///
    /// Resolution order:
    /// 1. existing provider link -> refresh mutable profile fields;
    /// 2. case-insensitive email match -> create the link;
    /// 3. `create_if_missing` -> allocate a user with a unique username; a
    ///    unique-violation race falls back to step 2;
    /// 4. otherwise resolve to nobody.
    pub async fn sync_provider_user(
        &self,
        claims: &IdentityClaims,
        create_if_missing: bool,
    ) -> Result<SyncOutcome, StoreError> {
        // Step 1: existing link.
        if let Some(link) = self
            .store
            .get_link(claims.provider, &claims.provider_user_id)
            .await?
        {
            let updated = self.refresh_profile(link.user_id, claims).await?;
            return Ok(SyncOutcome {
                user_id: Some(link.user_id),
                created: false,
                updated,
            });
        }

        // Step 2: match an existing account by email.
        if let Some(outcome) = self.link_by_email(claims).await? {
            return Ok(outcome);
        }

        if !create_if_missing {
            return Ok(SyncOutcome::none());
        }

        // Step 3: allocate a fresh user.
        let username = self.unique_username(claims).await?;
        let mut user = User::new(
            username,
            claims.email.clone().unwrap_or_default(),
            UserRole::Member,
        );
        user.verified = claims.email_verified;
        user.first_name = claims.first_name.clone();
        user.last_name = claims.last_name.clone();
        user.avatar_url = claims.avatar_url.clone();

        match self.store.create_user(&user).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(detail)) => {
                // Lost a race with a concurrent sync for the same identity;
                // the email match must succeed now.
                warn!(detail, "user creation raced, retrying email match");
                if let Some(outcome) = self.link_by_email(claims).await? {
                    return Ok(outcome);
                }
                return Err(StoreError::UniqueViolation(detail));
            }
            Err(e) => return Err(e),
        }

        self.create_link_for(user.id, claims).await?;
        info!(
            user_id = %user.id,
            provider = ?claims.provider,
            "created user from external identity"
        );
        Ok(SyncOutcome {
            user_id: Some(user.id),
            created: true,
            updated: false,
        })
    }

    /// Step 2 helper: find a user by the claims email (case-insensitive) and
    /// attach the provider link.
    async fn link_by_email(
        &self,
        claims: &IdentityClaims,
    ) -> Result<Option<SyncOutcome>, StoreError> {
        let Some(email) = claims.email.as_deref().filter(|e| !e.is_empty()) else {
            return Ok(None);
        };
        let Some(user) = self.store.get_user_by_email(email).await? else {
            return Ok(None);
        };

        self.create_link_for(user.id, claims).await?;
        info!(user_id = %user.id, provider = ?claims.provider, "linked existing user by email");
        Ok(Some(SyncOutcome {
            user_id: Some(user.id),
            created: false,
            updated: true,
        }))
    }

    async fn create_link_for(
        &self,
        user_id: Uuid,
        claims: &IdentityClaims,
    ) -> Result<(), StoreError> {
        let link = ProviderLink {
            id: Uuid::new_v4(),
            user_id,
            provider: claims.provider,
            provider_user_id: claims.provider_user_id.clone(),
            created_at: Utc::now(),
        };
        match self.store.create_link(&link).await {
            Ok(()) => Ok(()),
            // A concurrent sync already attached the same identity.
            Err(StoreError::UniqueViolation(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Refresh mutable profile fields from fresh claims. Returns `true` when
    /// anything changed.
    async fn refresh_profile(
        &self,
        user_id: Uuid,
        claims: &IdentityClaims,
    ) -> Result<bool, StoreError> {
        let Some(mut user) = self.store.get_user(user_id).await? else {
            return Ok(false);
        };

        let mut changed = false;
        if claims.first_name.is_some() && claims.first_name != user.first_name {
            user.first_name = claims.first_name.clone();
            changed = true;
        }
        if claims.last_name.is_some() && claims.last_name != user.last_name {
            user.last_name = claims.last_name.clone();
            changed = true;
        }
        if claims.avatar_url.is_some() && claims.avatar_url != user.avatar_url {
            user.avatar_url = claims.avatar_url.clone();
            changed = true;
        }

        if changed {
            user.updated_at = Utc::now();
            self.store.update_user(&user).await?;
        }
        Ok(changed)
    }

    /// Derive a unique username from the email local-part, or from the
    /// provider identity when no email is available. Collisions get a
    /// `-2`, `-3`, ... suffix.
    async fn unique_username(&self, claims: &IdentityClaims) -> Result<String, StoreError> {
        let base = claims
            .email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|s| !s.is_empty())
            .map(sanitize)
            .unwrap_or_else(|| {
                format!(
                    "{}-{}",
                    provider_slug(claims.provider),
                    sanitize(&claims.provider_user_id)
                )
            });

        if self.store.get_user_by_username(&base).await?.is_none() {
            return Ok(base);
        }
        for n in 2..=MAX_USERNAME_ATTEMPTS {
            let candidate = format!("{base}-{n}");
            if self.store.get_user_by_username(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Ok(format!("{base}-{}", &Uuid::new_v4().to_string()[..8]))
    }

    /// Deactivate the local user attached to an external identity. Returns
    /// `false` when no link exists.
    pub async fn deactivate_provider_user(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<bool, StoreError> {
        let Some(link) = self.store.get_link(provider, provider_user_id).await? else {
            return Ok(false);
        };
        let Some(mut user) = self.store.get_user(link.user_id).await? else {
            return Ok(false);
        };
        user.active = false;
        user.updated_at = Utc::now();
        self.store.update_user(&user).await?;
        info!(user_id = %user.id, "deactivated user from provider webhook");
        Ok(true)
    }

    /// Explicitly link a provider identity to a user. Fails with a conflict
    /// when the identity is already attached to a different user.
    pub async fn link_provider(
        &self,
        user_id: Uuid,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<ProviderLink, StoreError> {
        if let Some(existing) = self.store.get_link(provider, provider_user_id).await? {
            if existing.user_id == user_id {
                return Ok(existing);
            }
            return Err(StoreError::UniqueViolation(
                "identity already linked to another user".into(),
            ));
        }
        let link = ProviderLink {
            id: Uuid::new_v4(),
            user_id,
            provider,
            provider_user_id: provider_user_id.to_string(),
            created_at: Utc::now(),
        };
        self.store.create_link(&link).await?;
        Ok(link)
    }

    pub async fn unlink_provider(
        &self,
        provider: AuthProviderKind,
        provider_user_id: &str,
    ) -> Result<bool, StoreError> {
        self.store.delete_link(provider, provider_user_id).await
    }
}

fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}

fn provider_slug(p: AuthProviderKind) -> &'static str {
    match p {
        AuthProviderKind::Local => "local",
        AuthProviderKind::Clerk => "clerk",
        AuthProviderKind::Workos => "workos",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryUserStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn claims(email: Option<&str>) -> IdentityClaims {
        let mut c = IdentityClaims::new(AuthProviderKind::Clerk, "user_abc");
        c.email = email.map(String::from);
        c.email_verified = true;
        c
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let store = Arc::new(MemoryUserStore::new());
        let sync = IdentitySync::new(store);

        let first = sync
            .sync_provider_user(&claims(Some("new@example.com")), true)
            .await
            .unwrap();
        assert!(first.created);

        let second = sync
            .sync_provider_user(&claims(Some("new@example.com")), true)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.user_id, second.user_id);
    }

    #[tokio::test]
    async fn email_match_links_instead_of_creating() {
        let store = Arc::new(MemoryUserStore::new());
        let existing = User::new("manual", "Person@Example.com", UserRole::Member);
        store.create_user(&existing).await.unwrap();

        let sync = IdentitySync::new(store.clone());
        let outcome = sync
            .sync_provider_user(&claims(Some("person@example.COM")), true)
            .await
            .unwrap();

        assert_eq!(outcome.user_id, Some(existing.id));
        assert!(!outcome.created);
        assert!(outcome.updated);
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_email_skips_match_and_derives_username_from_provider() {
        let store = Arc::new(MemoryUserStore::new());
        let sync = IdentitySync::new(store.clone());

        let outcome = sync.sync_provider_user(&claims(None), true).await.unwrap();
        assert!(outcome.created);

        let user = store.get_user(outcome.user_id.unwrap()).await.unwrap().unwrap();
        assert!(user.username.starts_with("clerk-"));
    }

    #[tokio::test]
    async fn no_create_resolves_to_nobody() {
        let store = Arc::new(MemoryUserStore::new());
        let sync = IdentitySync::new(store);
        let outcome = sync
            .sync_provider_user(&claims(Some("nobody@example.com")), false)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::none());
    }

    #[tokio::test]
    async fn username_collision_gets_suffix() {
        let store = Arc::new(MemoryUserStore::new());
        store
            .create_user(&User::new("taken", "other@example.com", UserRole::Member))
            .await
            .unwrap();

        let sync = IdentitySync::new(store.clone());
        let outcome = sync
            .sync_provider_user(&claims(Some("taken@new.example.com")), true)
            .await
            .unwrap();

        let user = store.get_user(outcome.user_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(user.username, "taken-2");
    }

    #[tokio::test]
    async fn second_sync_refreshes_profile_fields() {
        let store = Arc::new(MemoryUserStore::new());
        let sync = IdentitySync::new(store.clone());
        let first = sync
            .sync_provider_user(&claims(Some("ava@example.com")), true)
            .await
            .unwrap();

        let mut updated_claims = claims(Some("ava@example.com"));
        updated_claims.first_name = Some("Ava".into());
        updated_claims.avatar_url = Some("https://img.example/ava.png".into());

        let second = sync.sync_provider_user(&updated_claims, true).await.unwrap();
        assert_eq!(second.user_id, first.user_id);
        assert!(second.updated);

        let user = store.get_user(first.user_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(user.first_name.as_deref(), Some("Ava"));
    }

    /// Store wrapper that fails the first `create_user` with a unique
    /// violation after inserting the same email behind the caller's back,
    /// simulating a lost creation race.
    struct RacingStore {
        inner: MemoryUserStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl UserStore for RacingStore {
        async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
            self.inner.get_user(id).await
        }
        async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
            self.inner.get_user_by_email(email).await
        }
        async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
            self.inner.get_user_by_username(username).await
        }
        async fn create_user(&self, user: &User) -> Result<(), StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                // The "other" process wins the insert.
                let winner = User::new("winner", user.email.clone(), UserRole::Member);
                self.inner.create_user(&winner).await.unwrap();
                return Err(StoreError::UniqueViolation("email".into()));
            }
            self.inner.create_user(user).await
        }
        async fn update_user(&self, user: &User) -> Result<(), StoreError> {
            self.inner.update_user(user).await
        }
        async fn count_users(&self) -> Result<u64, StoreError> {
            self.inner.count_users().await
        }
        async fn get_link(
            &self,
            provider: AuthProviderKind,
            provider_user_id: &str,
        ) -> Result<Option<ProviderLink>, StoreError> {
            self.inner.get_link(provider, provider_user_id).await
        }
        async fn get_links_for_user(
            &self,
            user_id: Uuid,
        ) -> Result<Vec<ProviderLink>, StoreError> {
            self.inner.get_links_for_user(user_id).await
        }
        async fn create_link(&self, link: &ProviderLink) -> Result<(), StoreError> {
            self.inner.create_link(link).await
        }
        async fn delete_link(
            &self,
            provider: AuthProviderKind,
            provider_user_id: &str,
        ) -> Result<bool, StoreError> {
            self.inner.delete_link(provider, provider_user_id).await
        }
        async fn get_invite(&self, id: Uuid) -> Result<Option<crate::store::Invite>, StoreError> {
            self.inner.get_invite(id).await
        }
        async fn create_invite(&self, invite: &crate::store::Invite) -> Result<(), StoreError> {
            self.inner.create_invite(invite).await
        }
        async fn update_invite(&self, invite: &crate::store::Invite) -> Result<(), StoreError> {
            self.inner.update_invite(invite).await
        }
        async fn get_or_create_plan(
            &self,
            user_id: Uuid,
        ) -> Result<crate::store::UserPlanSettings, StoreError> {
            self.inner.get_or_create_plan(user_id).await
        }
    }

    #[tokio::test]
    async fn creation_race_falls_back_to_email_match() {
        let store = Arc::new(RacingStore {
            inner: MemoryUserStore::new(),
            raced: AtomicBool::new(false),
        });
        let sync = IdentitySync::new(store.clone());

        let outcome = sync
            .sync_provider_user(&claims(Some("raced@example.com")), true)
            .await
            .unwrap();

        // Resolved to the winner's user without creating a duplicate.
        assert!(!outcome.created);
        assert!(outcome.user_id.is_some());
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn link_provider_conflict_on_foreign_user() {
        let store = Arc::new(MemoryUserStore::new());
        let sync = IdentitySync::new(store.clone());

        let a = User::new("a", "a@example.com", UserRole::Member);
        let b = User::new("b", "b@example.com", UserRole::Member);
        store.create_user(&a).await.unwrap();
        store.create_user(&b).await.unwrap();

        sync.link_provider(a.id, AuthProviderKind::Workos, "ext-1")
            .await
            .unwrap();
        // Linking the same identity to the same user is a no-op.
        sync.link_provider(a.id, AuthProviderKind::Workos, "ext-1")
            .await
            .unwrap();
        // A different user conflicts.
        assert!(matches!(
            sync.link_provider(b.id, AuthProviderKind::Workos, "ext-1")
                .await
                .unwrap_err(),
            StoreError::UniqueViolation(_)
        ));
    }

    #[tokio::test]
    async fn deactivate_via_link() {
        let store = Arc::new(MemoryUserStore::new());
        let sync = IdentitySync::new(store.clone());
        let outcome = sync
            .sync_provider_user(&claims(Some("gone@example.com")), true)
            .await
            .unwrap();

        assert!(sync
            .deactivate_provider_user(AuthProviderKind::Clerk, "user_abc")
            .await
            .unwrap());
        let user = store.get_user(outcome.user_id.unwrap()).await.unwrap().unwrap();
        assert!(!user.active);

        assert!(!sync
            .deactivate_provider_user(AuthProviderKind::Clerk, "missing")
            .await
            .unwrap());
    }
}
