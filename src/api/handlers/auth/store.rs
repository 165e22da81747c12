//! Store traits for identities and magic tokens, plus the identity cache.
//!
//! Flow Overview:
//! - `IdentityStore` holds the security stamp that every verified token is
//!   compared against. Rotating it invalidates all outstanding sessions.
//! - `MagicTokenStore::redeem` is a single conditional write that also yields the
//!   owning identity; implementations must never split it into a read followed by
//!   a write, and nothing after the write can fail and strand a burned link.
//! - `CachedIdentityStore` bounds revocation staleness to a seconds-scale TTL.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use super::roles::Role;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// A person who can authenticate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct Identity {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub security_stamp: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data store unavailable: {0}")]
    Unavailable(String),
    #[error("data store query failed: {0}")]
    Query(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Result of a single conditional redeem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The token was burned; carries its active owner as read by the same write.
    Redeemed(Identity),
    /// No such token, or its owner is missing or disabled.
    Unknown,
    Expired,
    AlreadyUsed,
}

/// A magic token ready to persist. Only the hash of the raw token is stored.
#[derive(Clone, Debug)]
pub struct NewMagicToken {
    pub token_hash: Vec<u8>,
    pub identity_id: Uuid,
    pub expires_at: i64,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fetch an active identity. Soft-deleted identities are `None`.
    async fn find(&self, id: Uuid) -> Result<Option<Identity>, StoreError>;

    /// Find the identity bound to an external (bot/host) user id, creating it on
    /// first contact. Returns `None` when the identity exists but is disabled.
    async fn find_or_create_external(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Option<Identity>, StoreError>;

    /// Replace the security stamp; returns the new stamp, or `None` if the
    /// identity does not exist.
    async fn rotate_stamp(&self, id: Uuid) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait MagicTokenStore: Send + Sync {
    async fn insert(&self, token: NewMagicToken) -> Result<(), StoreError>;

    /// Atomically mark the token used if it is unused, unexpired at `now` and owned
    /// by an active identity, returning that identity from the same operation.
    /// A failed call must leave the token unused.
    async fn redeem(&self, token_hash: &[u8], now: i64) -> Result<RedeemOutcome, StoreError>;

    /// Drop every unused token of the identity; returns how many were removed.
    async fn invalidate_outstanding(&self, identity_id: Uuid) -> Result<u64, StoreError>;

    /// Delete tokens whose expiry is at or before `now`.
    async fn purge_expired(&self, now: i64) -> Result<u64, StoreError>;
}

/// Run a store operation, retrying transient failures with exponential backoff.
pub(crate) async fn with_retry<T, E, F, Fut>(
    operation: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<StoreError>,
{
    let mut attempt = 1;
    let mut delay = RETRY_BASE_DELAY;
    loop {
        match call().await.map_err(Into::into) {
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(operation, attempt, "Transient store failure, retrying: {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Short-TTL read-through cache in front of an [`IdentityStore`].
///
/// Every rotation bumps an epoch; a read that started before the bump never
/// caches its result, so a stale copy cannot outlive `rotate_stamp`.
pub struct CachedIdentityStore {
    inner: Arc<dyn IdentityStore>,
    ttl: Duration,
    entries: Mutex<CacheEntries>,
}

#[derive(Default)]
struct CacheEntries {
    identities: HashMap<Uuid, (Identity, Instant)>,
    epoch: u64,
}

impl CachedIdentityStore {
    pub fn new(inner: Arc<dyn IdentityStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(CacheEntries::default()),
        }
    }

    async fn epoch(&self) -> u64 {
        self.entries.lock().await.epoch
    }

    async fn remember(&self, identity: &Identity, read_epoch: u64) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().await;
        if entries.epoch != read_epoch {
            return;
        }
        let ttl = self.ttl;
        entries
            .identities
            .retain(|_, (_, cached_at)| cached_at.elapsed() < ttl);
        entries
            .identities
            .insert(identity.id, (identity.clone(), Instant::now()));
    }
}

#[async_trait]
impl IdentityStore for CachedIdentityStore {
    async fn find(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let read_epoch = {
            let entries = self.entries.lock().await;
            if let Some((identity, cached_at)) = entries.identities.get(&id) {
                if cached_at.elapsed() < self.ttl {
                    return Ok(Some(identity.clone()));
                }
            }
            entries.epoch
        };
        let identity = self.inner.find(id).await?;
        match &identity {
            Some(identity) => self.remember(identity, read_epoch).await,
            None => {
                self.entries.lock().await.identities.remove(&id);
            }
        }
        Ok(identity)
    }

    async fn find_or_create_external(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Option<Identity>, StoreError> {
        let read_epoch = self.epoch().await;
        let identity = self
            .inner
            .find_or_create_external(external_id, display_name)
            .await?;
        if let Some(identity) = &identity {
            self.remember(identity, read_epoch).await;
        }
        Ok(identity)
    }

    async fn rotate_stamp(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let stamp = self.inner.rotate_stamp(id).await?;
        let mut entries = self.entries.lock().await;
        entries.epoch = entries.epoch.wrapping_add(1);
        entries.identities.remove(&id);
        Ok(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::memory::MemoryStore;
    use anyhow::{Context, Result};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn cache_serves_reads_until_rotation() -> Result<()> {
        let memory = Arc::new(MemoryStore::new());
        let identity = memory.create_identity(Role::Owner, None).await;
        let cached = CachedIdentityStore::new(memory.clone(), Duration::from_secs(60));

        let first = cached.find(identity.id).await?.context("identity")?;
        // A change behind the cache's back stays invisible until the TTL elapses.
        memory.set_role(identity.id, Role::Agent).await;
        let second = cached.find(identity.id).await?.context("identity")?;
        assert_eq!(first.role, second.role);

        let stamp = cached.rotate_stamp(identity.id).await?.context("stamp")?;
        let third = cached.find(identity.id).await?.context("identity")?;
        assert_eq!(third.security_stamp, stamp);
        assert_eq!(third.role, Role::Agent);
        Ok(())
    }

    /// Identity store whose first `find` pauses after reading, until released.
    struct PausedRead {
        inner: Arc<MemoryStore>,
        armed: AtomicBool,
        read_done: Notify,
        release: Notify,
    }

    #[async_trait]
    impl IdentityStore for PausedRead {
        async fn find(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
            let found = self.inner.find(id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.read_done.notify_one();
                self.release.notified().await;
            }
            Ok(found)
        }

        async fn find_or_create_external(
            &self,
            external_id: &str,
            display_name: Option<&str>,
        ) -> Result<Option<Identity>, StoreError> {
            self.inner
                .find_or_create_external(external_id, display_name)
                .await
        }

        async fn rotate_stamp(&self, id: Uuid) -> Result<Option<String>, StoreError> {
            self.inner.rotate_stamp(id).await
        }
    }

    #[tokio::test]
    async fn read_racing_rotation_is_not_cached() -> Result<()> {
        let memory = Arc::new(MemoryStore::new());
        let identity = memory.create_identity(Role::Owner, None).await;
        let paused = Arc::new(PausedRead {
            inner: memory.clone(),
            armed: AtomicBool::new(true),
            read_done: Notify::new(),
            release: Notify::new(),
        });
        let cached = Arc::new(CachedIdentityStore::new(
            paused.clone(),
            Duration::from_secs(60),
        ));

        let id = identity.id;
        let reader = {
            let cached = cached.clone();
            tokio::spawn(async move { cached.find(id).await })
        };
        paused.read_done.notified().await;
        let stamp = cached.rotate_stamp(identity.id).await?.context("stamp")?;
        paused.release.notify_one();

        // The in-flight read saw the old stamp but must not be remembered.
        let stale = reader.await??.context("identity")?;
        assert_eq!(stale.security_stamp, identity.security_stamp);
        let fresh = cached.find(identity.id).await?.context("identity")?;
        assert_eq!(fresh.security_stamp, stamp);
        Ok(())
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() -> Result<()> {
        let memory = Arc::new(MemoryStore::new());
        let identity = memory.create_identity(Role::Admin, None).await;
        let cached = CachedIdentityStore::new(memory.clone(), Duration::ZERO);

        cached.find(identity.id).await?;
        memory.set_role(identity.id, Role::Agent).await;
        let fresh = cached.find(identity.id).await?.context("identity")?;
        assert_eq!(fresh.role, Role::Agent);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry("test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("down".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), StoreError> = with_retry("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_query_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), StoreError> = with_retry("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Query("syntax".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sqlx_pool_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }
}
