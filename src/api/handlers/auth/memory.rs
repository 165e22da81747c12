//! In-process store used for local development and tests.
//!
//! A single mutex guards both maps, so `redeem` performs its check-and-set while
//! holding the lock.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    roles::Role,
    store::{Identity, IdentityStore, MagicTokenStore, NewMagicToken, RedeemOutcome, StoreError},
    utils::generate_security_stamp,
};

struct MagicRecord {
    identity_id: Uuid,
    expires_at: i64,
    used: bool,
}

struct StoredIdentity {
    identity: Identity,
    active: bool,
}

#[derive(Default)]
struct Inner {
    identities: HashMap<Uuid, StoredIdentity>,
    external: HashMap<String, Uuid>,
    magic_tokens: HashMap<Vec<u8>, MagicRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn new_stamp() -> Result<String, StoreError> {
    generate_security_stamp().map_err(|err| StoreError::Unavailable(err.to_string()))
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an identity directly, bypassing external bootstrap.
    pub async fn create_identity(&self, role: Role, tenant_id: Option<Uuid>) -> Identity {
        let identity = Identity {
            id: Uuid::new_v4(),
            external_id: None,
            display_name: None,
            role,
            tenant_id,
            security_stamp: Uuid::new_v4().simple().to_string(),
        };
        self.inner.lock().await.identities.insert(
            identity.id,
            StoredIdentity {
                identity: identity.clone(),
                active: true,
            },
        );
        identity
    }

    /// Change an identity's role without rotating its stamp.
    pub async fn set_role(&self, id: Uuid, role: Role) {
        if let Some(stored) = self.inner.lock().await.identities.get_mut(&id) {
            stored.identity.role = role;
        }
    }

    /// Soft-delete an identity.
    pub async fn disable(&self, id: Uuid) {
        if let Some(stored) = self.inner.lock().await.identities.get_mut(&id) {
            stored.active = false;
        }
    }

    /// Number of magic tokens currently held, used or not.
    pub async fn magic_token_count(&self) -> usize {
        self.inner.lock().await.magic_tokens.len()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .identities
            .get(&id)
            .filter(|stored| stored.active)
            .map(|stored| stored.identity.clone()))
    }

    async fn find_or_create_external(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Option<Identity>, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.external.get(external_id).copied() {
            let Some(stored) = inner.identities.get_mut(&id) else {
                return Err(StoreError::Corrupt(format!(
                    "external id {external_id} points to a missing identity"
                )));
            };
            if let Some(name) = display_name {
                stored.identity.display_name = Some(name.to_string());
            }
            return Ok(stored.active.then(|| stored.identity.clone()));
        }

        let identity = Identity {
            id: Uuid::new_v4(),
            external_id: Some(external_id.to_string()),
            display_name: display_name.map(str::to_string),
            role: Role::Owner,
            tenant_id: None,
            security_stamp: new_stamp()?,
        };
        inner.external.insert(external_id.to_string(), identity.id);
        inner.identities.insert(
            identity.id,
            StoredIdentity {
                identity: identity.clone(),
                active: true,
            },
        );
        Ok(Some(identity))
    }

    async fn rotate_stamp(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let stamp = new_stamp()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.identities.get_mut(&id).map(|stored| {
            stored.identity.security_stamp.clone_from(&stamp);
            stamp
        }))
    }
}

#[async_trait]
impl MagicTokenStore for MemoryStore {
    async fn insert(&self, token: NewMagicToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.magic_tokens.contains_key(&token.token_hash) {
            return Err(StoreError::Query("duplicate magic token".to_string()));
        }
        inner.magic_tokens.insert(
            token.token_hash,
            MagicRecord {
                identity_id: token.identity_id,
                expires_at: token.expires_at,
                used: false,
            },
        );
        Ok(())
    }

    async fn redeem(&self, token_hash: &[u8], now: i64) -> Result<RedeemOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.magic_tokens.get(token_hash) else {
            return Ok(RedeemOutcome::Unknown);
        };
        if record.used {
            return Ok(RedeemOutcome::AlreadyUsed);
        }
        if now >= record.expires_at {
            return Ok(RedeemOutcome::Expired);
        }
        let Some(identity) = inner
            .identities
            .get(&record.identity_id)
            .filter(|stored| stored.active)
            .map(|stored| stored.identity.clone())
        else {
            return Ok(RedeemOutcome::Unknown);
        };
        if let Some(record) = inner.magic_tokens.get_mut(token_hash) {
            record.used = true;
        }
        Ok(RedeemOutcome::Redeemed(identity))
    }

    async fn invalidate_outstanding(&self, identity_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.magic_tokens.len();
        inner
            .magic_tokens
            .retain(|_, record| record.used || record.identity_id != identity_id);
        Ok((before - inner.magic_tokens.len()) as u64)
    }

    async fn purge_expired(&self, now: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.magic_tokens.len();
        inner.magic_tokens.retain(|_, record| record.expires_at > now);
        Ok((before - inner.magic_tokens.len()) as u64)
    }
}
