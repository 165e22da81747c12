//! Request-time session verification.
//!
//! Flow Overview:
//! 1) Pick the credential: session cookie first, then `Authorization: Bearer`.
//! 2) Verify signature and expiry with the [`TokenCodec`].
//! 3) Reject tenant references that are not UUIDs.
//! 4) Load the live identity and compare stamp, role and tenant with the token.
//! 5) Build an [`AuthContext`]; nothing is written on success.

use axum::http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    cookie::session_cookie_value,
    error::AuthError,
    roles::{Action, Role},
    store::IdentityStore,
    token::TokenCodec,
    utils::extract_bearer_token,
};

/// Transport the session token arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CredentialChannel {
    Cookie,
    Bearer,
}

/// Request-scoped view of an admitted session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct AuthContext {
    pub identity_id: Uuid,
    pub role: Role,
    pub tenant_id: Option<Uuid>,
    pub expires_at: i64,
    pub channel: CredentialChannel,
}

impl AuthContext {
    #[must_use]
    pub fn can(&self, action: Action) -> bool {
        self.role.can(action)
    }

    /// # Errors
    /// Returns [`AuthError::PermissionDenied`] when the role is below the action's minimum.
    pub fn require(&self, action: Action) -> Result<(), AuthError> {
        if self.can(action) {
            Ok(())
        } else {
            debug!(identity_id = %self.identity_id, action = action.code(), "Permission denied");
            Err(AuthError::PermissionDenied)
        }
    }

    /// Staff may act on any tenant; tenant roles only on their own.
    ///
    /// # Errors
    /// Returns [`AuthError::PermissionDenied`] for a foreign or missing tenant.
    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<(), AuthError> {
        if self.role.is_staff() || self.tenant_id == Some(tenant_id) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied)
        }
    }
}

/// Pick the session token, cookie before bearer.
pub(crate) fn extract_credential(headers: &HeaderMap) -> Option<(String, CredentialChannel)> {
    session_cookie_value(headers)
        .map(|token| (token, CredentialChannel::Cookie))
        .or_else(|| extract_bearer_token(headers).map(|token| (token, CredentialChannel::Bearer)))
}

#[derive(Clone)]
pub struct SessionVerifier {
    codec: TokenCodec,
    identities: Arc<dyn IdentityStore>,
}

impl SessionVerifier {
    pub fn new(codec: TokenCodec, identities: Arc<dyn IdentityStore>) -> Self {
        Self { codec, identities }
    }

    /// Verify the credential carried by the request headers.
    ///
    /// # Errors
    /// Returns the [`AuthError`] matching the step that rejected the request.
    pub async fn verify(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let (token, channel) = extract_credential(headers).ok_or(AuthError::CredentialsMissing)?;
        self.verify_token_at(&token, channel, OffsetDateTime::now_utc().unix_timestamp())
            .await
    }

    /// Verify a raw token as of `now` (unix seconds).
    ///
    /// # Errors
    /// Returns the [`AuthError`] matching the step that rejected the token.
    pub async fn verify_token_at(
        &self,
        token: &str,
        channel: CredentialChannel,
        now: i64,
    ) -> Result<AuthContext, AuthError> {
        let claims = self.codec.verify_at(token, now).map_err(|err| {
            debug!("Session token rejected: {err}");
            AuthError::from(err)
        })?;

        let tenant_id = claims
            .tenant_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| {
                debug!(identity_id = %claims.identity_id, "Malformed tenant id in session");
                AuthError::MalformedTenantId
            })?;

        let identity = self
            .identities
            .find(claims.identity_id)
            .await
            .map_err(|err| {
                error!("Identity lookup failed: {err}");
                AuthError::StoreUnavailable
            })?
            .ok_or_else(|| {
                debug!(identity_id = %claims.identity_id, "Session for missing or disabled identity");
                AuthError::SessionRevoked
            })?;

        if identity.security_stamp != claims.security_stamp
            || identity.role != claims.role
            || identity.tenant_id != tenant_id
        {
            debug!(identity_id = %identity.id, "Session no longer matches identity");
            return Err(AuthError::SessionRevoked);
        }

        Ok(AuthContext {
            identity_id: identity.id,
            role: identity.role,
            tenant_id,
            expires_at: claims.expires_at,
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::{
        cookie::SESSION_COOKIE_NAME,
        memory::MemoryStore,
        state::TtlTiers,
        store::Identity,
        token::NewSession,
    };
    use anyhow::{Context, Result};
    use axum::http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderValue,
    };
    use base64ct::{Base64UrlUnpadded, Encoding};
    use hmac::{Hmac, Mac};
    use secrecy::SecretString;

    const NOW: i64 = 1_700_000_000;

    fn codec() -> TokenCodec {
        TokenCodec::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            TtlTiers::default(),
        )
    }

    fn session_for(identity: &Identity) -> NewSession {
        NewSession {
            identity_id: identity.id,
            role: identity.role,
            tenant_id: identity.tenant_id,
            security_stamp: identity.security_stamp.clone(),
        }
    }

    async fn setup(role: Role) -> Result<(Arc<MemoryStore>, SessionVerifier, Identity, String)> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(role, Some(Uuid::new_v4())).await;
        let verifier = SessionVerifier::new(codec(), store.clone());
        let token = codec().issue_at(&session_for(&identity), NOW)?.token;
        Ok((store, verifier, identity, token))
    }

    #[tokio::test]
    async fn admits_current_session() -> Result<()> {
        let (_, verifier, identity, token) = setup(Role::Admin).await?;
        let context = verifier
            .verify_token_at(&token, CredentialChannel::Bearer, NOW + 1)
            .await?;
        assert_eq!(context.identity_id, identity.id);
        assert_eq!(context.role, Role::Admin);
        assert_eq!(context.tenant_id, identity.tenant_id);
        assert!(context.can(Action::ManageCoupons));
        assert!(context.require(Action::WithdrawFunds).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn rotated_stamp_revokes_valid_token() -> Result<()> {
        let (store, verifier, identity, token) = setup(Role::Owner).await?;
        store.rotate_stamp(identity.id).await?;
        let result = verifier
            .verify_token_at(&token, CredentialChannel::Cookie, NOW + 1)
            .await;
        assert_eq!(result, Err(AuthError::SessionRevoked));
        // The token itself is still well signed and unexpired.
        assert!(codec().verify_at(&token, NOW + 1).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn demotion_and_disable_revoke() -> Result<()> {
        let (store, verifier, identity, token) = setup(Role::Owner).await?;
        store.set_role(identity.id, Role::Agent).await;
        let result = verifier
            .verify_token_at(&token, CredentialChannel::Cookie, NOW + 1)
            .await;
        assert_eq!(result, Err(AuthError::SessionRevoked));

        let (store, verifier, identity, token) = setup(Role::Agent).await?;
        store.disable(identity.id).await;
        let result = verifier
            .verify_token_at(&token, CredentialChannel::Cookie, NOW + 1)
            .await;
        assert_eq!(result, Err(AuthError::SessionRevoked));
        Ok(())
    }

    #[tokio::test]
    async fn codec_failures_map_to_session_errors() -> Result<()> {
        let (_, verifier, _, token) = setup(Role::Agent).await?;
        let expired = verifier
            .verify_token_at(&token, CredentialChannel::Cookie, NOW + 10 * 24 * 60 * 60)
            .await;
        assert_eq!(expired, Err(AuthError::SessionExpired));

        let garbage = verifier
            .verify_token_at("v1.abc", CredentialChannel::Cookie, NOW)
            .await;
        assert_eq!(garbage, Err(AuthError::SessionInvalid));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_tenant_is_forbidden() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let identity = store.create_identity(Role::Agent, None).await;
        let verifier = SessionVerifier::new(codec(), store.clone());

        // Forge a correctly signed token carrying a bad tenant reference.
        let claims = serde_json::json!({
            "sub": identity.id,
            "role": "agent",
            "tid": "tenant-42",
            "stamp": identity.security_stamp,
            "iat": NOW,
            "exp": NOW + 60,
        });
        let payload = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&claims)?);
        let token = sign(&format!("v1.{payload}"))?;

        let result = verifier
            .verify_token_at(&token, CredentialChannel::Bearer, NOW)
            .await;
        assert_eq!(result, Err(AuthError::MalformedTenantId));
        Ok(())
    }

    fn sign(signed: &str) -> Result<String> {
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"0123456789abcdef0123456789abcdef")
            .map_err(|_| anyhow::anyhow!("invalid hmac key"))?;
        mac.update(signed.as_bytes());
        let signature = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());
        Ok(format!("{signed}.{signature}"))
    }

    #[tokio::test]
    async fn cookie_takes_priority_over_bearer() -> Result<()> {
        let (_, verifier, identity, _) = setup(Role::Owner).await?;
        // `verify` checks expiry against the wall clock.
        let token = codec().issue(&session_for(&identity))?.token;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer not-a-token"));
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE_NAME}={token}"))?,
        );
        let (picked, channel) = extract_credential(&headers).context("credential")?;
        assert_eq!(picked, token);
        assert_eq!(channel, CredentialChannel::Cookie);

        let context = verifier.verify(&headers).await?;
        assert_eq!(context.identity_id, identity.id);
        assert_eq!(context.channel, CredentialChannel::Cookie);
        Ok(())
    }

    #[tokio::test]
    async fn bearer_used_without_cookie() -> Result<()> {
        let (_, verifier, identity, _) = setup(Role::Owner).await?;
        let token = codec().issue(&session_for(&identity))?.token;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        let context = verifier.verify(&headers).await?;
        assert_eq!(context.channel, CredentialChannel::Bearer);

        let empty = verifier.verify(&HeaderMap::new()).await;
        assert_eq!(empty, Err(AuthError::CredentialsMissing));
        Ok(())
    }

    #[test]
    fn tenant_scope_checks() {
        let tenant = Uuid::new_v4();
        let mut context = AuthContext {
            identity_id: Uuid::new_v4(),
            role: Role::Owner,
            tenant_id: Some(tenant),
            expires_at: NOW,
            channel: CredentialChannel::Cookie,
        };
        assert!(context.require_tenant(tenant).is_ok());
        assert!(context.require_tenant(Uuid::new_v4()).is_err());

        context.tenant_id = None;
        assert!(context.require_tenant(tenant).is_err());

        context.role = Role::PlatformSupport;
        assert!(context.require_tenant(tenant).is_ok());
    }
}
