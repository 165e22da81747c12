//! Signed, time-limited session tokens.
//!
//! Wire format: `v1.<payload>.<signature>` where `payload` is base64url (unpadded)
//! JSON claims and `signature` is base64url HMAC-SHA256 over `v1.<payload>` keyed
//! with the process secret. Verification checks the MAC before looking at the
//! claims, so a tampered payload is never parsed as trusted input.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{roles::Role, state::TtlTiers};

type HmacSha256 = Hmac<Sha256>;

const VERSION: &str = "v1";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

/// Claims supplied by the caller when issuing a token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSession {
    pub identity_id: Uuid,
    pub role: Role,
    pub tenant_id: Option<Uuid>,
    pub security_stamp: String,
}

/// Claims recovered from a verified token.
///
/// `tenant_id` stays raw: the verifier decides whether it is well formed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionClaims {
    pub identity_id: Uuid,
    pub role: Role,
    pub tenant_id: Option<String>,
    pub security_stamp: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Serialize, Deserialize)]
struct WireClaims {
    sub: Uuid,
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tid: Option<String>,
    stamp: String,
    iat: i64,
    exp: i64,
}

/// A freshly issued token and its expiry.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl IssuedToken {
    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.expires_at - self.issued_at
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    secret: SecretString,
    tiers: TtlTiers,
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: SecretString, tiers: TtlTiers) -> Self {
        Self { secret, tiers }
    }

    #[must_use]
    pub fn tiers(&self) -> &TtlTiers {
        &self.tiers
    }

    /// Issue a token valid from now.
    ///
    /// # Errors
    /// Returns an error if the claims cannot be serialized.
    pub fn issue(&self, session: &NewSession) -> Result<IssuedToken, TokenError> {
        self.issue_at(session, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Issue a token as of `now` (unix seconds).
    ///
    /// # Errors
    /// Returns an error if the claims cannot be serialized.
    pub fn issue_at(&self, session: &NewSession, now: i64) -> Result<IssuedToken, TokenError> {
        let expires_at = now + self.tiers.ttl_seconds(session.role);
        let claims = WireClaims {
            sub: session.identity_id,
            role: session.role.as_str().to_string(),
            tid: session.tenant_id.map(|tenant| tenant.to_string()),
            stamp: session.security_stamp.clone(),
            iat: now,
            exp: expires_at,
        };
        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Malformed)?;
        let signed = format!("{VERSION}.{}", Base64UrlUnpadded::encode_string(&payload));
        let signature = Base64UrlUnpadded::encode_string(&self.mac(signed.as_bytes())?);
        Ok(IssuedToken {
            token: format!("{signed}.{signature}"),
            issued_at: now,
            expires_at,
        })
    }

    /// Verify a token against the current time.
    ///
    /// # Errors
    /// Returns [`TokenError`] describing why the token was rejected.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        self.verify_at(token, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify a token as of `now` (unix seconds).
    ///
    /// # Errors
    /// Returns [`TokenError::Malformed`] for structural problems,
    /// [`TokenError::InvalidSignature`] when the MAC does not match and
    /// [`TokenError::Expired`] once `now` reaches the expiry.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<SessionClaims, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(version), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        if version != VERSION || payload_b64.is_empty() {
            return Err(TokenError::Malformed);
        }
        let signature =
            Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| TokenError::InvalidSignature)?;

        let mut mac = self.keyed_mac()?;
        mac.update(VERSION.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let payload = Base64UrlUnpadded::decode_vec(payload_b64).map_err(|_| TokenError::Malformed)?;
        let claims: WireClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        let role = Role::parse(&claims.role).ok_or(TokenError::Malformed)?;
        if claims.exp <= claims.iat {
            return Err(TokenError::Malformed);
        }
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(SessionClaims {
            identity_id: claims.sub,
            role,
            tenant_id: claims.tid,
            security_stamp: claims.stamp,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    fn keyed_mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| TokenError::Malformed)
    }

    fn mac(&self, input: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac = self.keyed_mac()?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
