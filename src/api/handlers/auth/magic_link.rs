//! One-time magic links.
//!
//! Flow Overview:
//! - `issue` stores the SHA-256 of a random token with a short expiry and hands the
//!   raw token back once.
//! - `redeem` is one conditional write in the store; the outcome decides between
//!   success and the three link errors.
//! - Expired rows are purged by a background task; redemption never depends on it.

use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use super::{
    error::AuthError,
    store::{Identity, MagicTokenStore, NewMagicToken, RedeemOutcome, StoreError},
    utils::{generate_magic_token, hash_token},
};

/// Browser redemption path.
pub const MAGIC_LINK_PATH: &str = "/auth/magic";

/// A freshly issued link token; the raw value is never stored.
#[derive(Clone, Debug)]
pub struct IssuedLink {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct MagicLinkBroker {
    store: Arc<dyn MagicTokenStore>,
    ttl_seconds: i64,
}

fn store_failure(err: &StoreError) -> AuthError {
    error!("Magic token store failure: {err}");
    AuthError::StoreUnavailable
}

impl MagicLinkBroker {
    pub fn new(store: Arc<dyn MagicTokenStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Issue a link; earlier outstanding links stay valid.
    ///
    /// # Errors
    /// Returns [`AuthError::StoreUnavailable`] if the token cannot be generated or stored.
    pub async fn issue(&self, identity_id: Uuid) -> Result<IssuedLink, AuthError> {
        self.issue_at(identity_id, OffsetDateTime::now_utc().unix_timestamp())
            .await
    }

    /// Issue a link after invalidating every unused link of the identity.
    ///
    /// # Errors
    /// Returns [`AuthError::StoreUnavailable`] on store failures.
    pub async fn issue_exclusive(&self, identity_id: Uuid) -> Result<IssuedLink, AuthError> {
        let dropped = self
            .store
            .invalidate_outstanding(identity_id)
            .await
            .map_err(|err| store_failure(&err))?;
        if dropped > 0 {
            debug!(%identity_id, dropped, "Invalidated outstanding magic links");
        }
        self.issue(identity_id).await
    }

    /// Issue a link as of `now` (unix seconds).
    ///
    /// # Errors
    /// Returns [`AuthError::StoreUnavailable`] on store or RNG failures.
    pub async fn issue_at(&self, identity_id: Uuid, now: i64) -> Result<IssuedLink, AuthError> {
        let token = generate_magic_token().map_err(|err| {
            error!("Failed to generate magic token: {err}");
            AuthError::StoreUnavailable
        })?;
        let expires_at = now + self.ttl_seconds;
        self.store
            .insert(NewMagicToken {
                token_hash: hash_token(&token),
                identity_id,
                expires_at,
            })
            .await
            .map_err(|err| store_failure(&err))?;
        info!(%identity_id, expires_at, "Issued magic link");
        Ok(IssuedLink { token, expires_at })
    }

    /// Burn the token and return its identity. A store failure leaves the link
    /// unused, so the same link can be retried.
    ///
    /// # Errors
    /// Returns [`AuthError::LinkInvalid`], [`AuthError::LinkExpired`] or
    /// [`AuthError::LinkAlreadyUsed`] for rejected links.
    pub async fn redeem(&self, token: &str) -> Result<Identity, AuthError> {
        self.redeem_at(token, OffsetDateTime::now_utc().unix_timestamp())
            .await
    }

    /// Burn the token as of `now` (unix seconds).
    ///
    /// # Errors
    /// See [`MagicLinkBroker::redeem`].
    pub async fn redeem_at(&self, token: &str, now: i64) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::LinkInvalid);
        }
        let outcome = self
            .store
            .redeem(&hash_token(token), now)
            .await
            .map_err(|err| store_failure(&err))?;
        let identity = match outcome {
            RedeemOutcome::Redeemed(identity) => identity,
            RedeemOutcome::Unknown => return Err(AuthError::LinkInvalid),
            RedeemOutcome::Expired => return Err(AuthError::LinkExpired),
            RedeemOutcome::AlreadyUsed => return Err(AuthError::LinkAlreadyUsed),
        };
        info!(identity_id = %identity.id, "Redeemed magic link");
        Ok(identity)
    }

    /// Delete expired tokens; returns how many were removed.
    ///
    /// # Errors
    /// Returns the underlying [`StoreError`].
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store
            .purge_expired(OffsetDateTime::now_utc().unix_timestamp())
            .await
    }
}

/// Build the browser URL for a magic token. A path in the base URL is kept as a
/// prefix, for deployments behind a proxy that mounts the service under it.
///
/// # Errors
/// Returns an error if the base URL is not absolute.
pub fn link_url(public_base_url: &str, token: &str) -> Result<String, url::ParseError> {
    let mut base = Url::parse(public_base_url)?;
    if !base.path().ends_with('/') {
        let prefix = format!("{}/", base.path());
        base.set_path(&prefix);
    }
    let mut url = base.join(MAGIC_LINK_PATH.trim_start_matches('/'))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::{memory::MemoryStore, roles::Role};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const NOW: i64 = 1_700_000_000;

    fn broker(store: &Arc<MemoryStore>) -> MagicLinkBroker {
        MagicLinkBroker::new(store.clone(), 600)
    }

    /// Token store whose next redeem fails before touching any row.
    struct FlakyTokens {
        inner: Arc<MemoryStore>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl MagicTokenStore for FlakyTokens {
        async fn insert(&self, token: NewMagicToken) -> Result<(), StoreError> {
            self.inner.insert(token).await
        }

        async fn redeem(&self, token_hash: &[u8], now: i64) -> Result<RedeemOutcome, StoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.redeem(token_hash, now).await
        }

        async fn invalidate_outstanding(&self, identity_id: Uuid) -> Result<u64, StoreError> {
            self.inner.invalidate_outstanding(identity_id).await
        }

        async fn purge_expired(&self, now: i64) -> Result<u64, StoreError> {
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn store_failure_keeps_link_redeemable() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Owner, None).await;
        let broker = MagicLinkBroker::new(
            Arc::new(FlakyTokens {
                inner: store.clone(),
                fail_next: AtomicBool::new(false),
            }),
            600,
        );
        let link = broker.issue_at(identity.id, NOW).await?;

        let flaky = FlakyTokens {
            inner: store.clone(),
            fail_next: AtomicBool::new(true),
        };
        let broker = MagicLinkBroker::new(Arc::new(flaky), 600);
        assert_eq!(
            broker.redeem_at(&link.token, NOW + 1).await.err(),
            Some(AuthError::StoreUnavailable)
        );
        assert_eq!(broker.redeem_at(&link.token, NOW + 2).await?, identity);
        Ok(())
    }

    #[tokio::test]
    async fn redeem_returns_identity_once() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Owner, None).await;
        let broker = broker(&store);

        let link = broker.issue_at(identity.id, NOW).await?;
        assert_eq!(link.expires_at, NOW + 600);

        let redeemed = broker.redeem_at(&link.token, NOW + 1).await?;
        assert_eq!(redeemed.id, identity.id);
        assert_eq!(
            broker.redeem_at(&link.token, NOW + 2).await.err(),
            Some(AuthError::LinkAlreadyUsed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_redeems_admit_exactly_one() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Agent, None).await;
        let broker = broker(&store);
        let link = broker.issue_at(identity.id, NOW).await?;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            let token = link.token.clone();
            tasks.push(tokio::spawn(async move {
                broker.redeem_at(&token, NOW + 1).await
            }));
        }
        let mut successes = 0;
        for task in tasks {
            match task.await? {
                Ok(_) => successes += 1,
                Err(err) => assert_eq!(err, AuthError::LinkAlreadyUsed),
            }
        }
        assert_eq!(successes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_unused_link_is_rejected() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Owner, None).await;
        let broker = broker(&store);
        let link = broker.issue_at(identity.id, NOW).await?;

        assert_eq!(
            broker.redeem_at(&link.token, link.expires_at).await.err(),
            Some(AuthError::LinkExpired)
        );
        // Still expired, not "used", on a second look.
        assert_eq!(
            broker.redeem_at(&link.token, link.expires_at + 5).await.err(),
            Some(AuthError::LinkExpired)
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_empty_tokens_are_invalid() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let broker = broker(&store);
        assert_eq!(
            broker.redeem_at("nope", NOW).await.err(),
            Some(AuthError::LinkInvalid)
        );
        assert_eq!(
            broker.redeem_at("  ", NOW).await.err(),
            Some(AuthError::LinkInvalid)
        );
        Ok(())
    }

    #[tokio::test]
    async fn disabled_identity_cannot_redeem() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Owner, None).await;
        let broker = broker(&store);
        let link = broker.issue_at(identity.id, NOW).await?;
        store.disable(identity.id).await;
        assert_eq!(
            broker.redeem_at(&link.token, NOW + 1).await.err(),
            Some(AuthError::LinkInvalid)
        );
        Ok(())
    }

    #[tokio::test]
    async fn exclusive_issue_invalidates_previous_links() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Owner, None).await;
        let broker = broker(&store);

        let first = broker.issue(identity.id).await?;
        let second = broker.issue(identity.id).await?;
        assert_eq!(store.magic_token_count().await, 2);

        let third = broker.issue_exclusive(identity.id).await?;
        assert_eq!(store.magic_token_count().await, 1);
        assert_eq!(
            broker.redeem(&first.token).await.err(),
            Some(AuthError::LinkInvalid)
        );
        assert_eq!(
            broker.redeem(&second.token).await.err(),
            Some(AuthError::LinkInvalid)
        );
        assert_eq!(broker.redeem(&third.token).await?.id, identity.id);
        Ok(())
    }

    #[test]
    fn link_url_encodes_token() -> Result<()> {
        let url = link_url("https://app.example.com", "a+b/c")?;
        assert_eq!(url, "https://app.example.com/auth/magic?token=a%2Bb%2Fc");
        for base in ["https://app.example.com/base/", "https://app.example.com/base"] {
            assert_eq!(
                link_url(base, "t")?,
                "https://app.example.com/base/auth/magic?token=t"
            );
        }
        assert!(link_url("not a url", "x").is_err());
        Ok(())
    }
}
