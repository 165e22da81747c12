//! Embedded-host identity assertions.
//!
//! The messaging host hands the mini-app a query string (`init data`) signed with a
//! key derived from the host bot token:
//!
//! - `secret = HMAC_SHA256(key = "WebAppData", msg = bot_token)`
//! - `hash = hex(HMAC_SHA256(key = secret, msg = data_check_string))`
//!
//! where `data_check_string` is every field except `hash`, formatted `key=value`,
//! sorted by key and joined with `\n`.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use super::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const HOST_KEY_LABEL: &[u8] = b"WebAppData";

/// Prefix of external ids created from host users.
pub const HOST_EXTERNAL_PREFIX: &str = "host:";

/// User asserted by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostUser {
    pub id: i64,
    pub display_name: Option<String>,
}

impl HostUser {
    #[must_use]
    pub fn external_id(&self) -> String {
        format!("{HOST_EXTERNAL_PREFIX}{}", self.id)
    }
}

#[derive(Deserialize)]
struct HostUserPayload {
    id: i64,
    first_name: Option<String>,
    last_name: Option<String>,
    username: Option<String>,
}

impl From<HostUserPayload> for HostUser {
    fn from(payload: HostUserPayload) -> Self {
        let full_name = [payload.first_name, payload.last_name]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let display_name = if full_name.is_empty() {
            payload.username
        } else {
            Some(full_name)
        };
        Self {
            id: payload.id,
            display_name,
        }
    }
}

#[derive(Clone)]
pub struct HostAssertionVerifier {
    secret_key: Vec<u8>,
    max_age_seconds: i64,
}

impl HostAssertionVerifier {
    #[must_use]
    pub fn new(bot_token: SecretString, max_age_seconds: i64) -> Self {
        let secret_key = derive_secret_key(bot_token.expose_secret());
        Self {
            secret_key,
            max_age_seconds,
        }
    }

    /// Check the signature and freshness of `init_data` as of `now` (unix seconds).
    ///
    /// # Errors
    /// [`AuthError::CredentialsMissing`] for empty input, [`AuthError::SessionInvalid`]
    /// for bad signatures or payloads and [`AuthError::SessionExpired`] when
    /// `auth_date` is older than the configured maximum age.
    pub fn verify(&self, init_data: &str, now: i64) -> Result<HostUser, AuthError> {
        let init_data = init_data.trim();
        if init_data.is_empty() {
            return Err(AuthError::CredentialsMissing);
        }

        let mut hash = None;
        let mut fields: Vec<(String, String)> = Vec::new();
        for (key, value) in url::form_urlencoded::parse(init_data.as_bytes()) {
            if key == "hash" {
                hash = Some(value.into_owned());
            } else {
                fields.push((key.into_owned(), value.into_owned()));
            }
        }
        let hash = hash.ok_or(AuthError::SessionInvalid)?;
        let expected = hex::decode(hash).map_err(|_| AuthError::SessionInvalid)?;

        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let data_check_string = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut mac = HmacSha256::new_from_slice(&self.secret_key)
            .map_err(|_| AuthError::SessionInvalid)?;
        mac.update(data_check_string.as_bytes());
        if mac.verify_slice(&expected).is_err() {
            debug!("Host init data signature mismatch");
            return Err(AuthError::SessionInvalid);
        }

        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        let auth_date: i64 = field("auth_date")
            .and_then(|value| value.parse().ok())
            .ok_or(AuthError::SessionInvalid)?;
        if now - auth_date > self.max_age_seconds {
            debug!(auth_date, "Host init data too old");
            return Err(AuthError::SessionExpired);
        }

        let user: HostUserPayload = field("user")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or(AuthError::SessionInvalid)?;
        Ok(user.into())
    }
}

fn derive_secret_key(bot_token: &str) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail.
    HmacSha256::new_from_slice(HOST_KEY_LABEL)
        .map(|mut mac| {
            mac.update(bot_token.as_bytes());
            mac.finalize().into_bytes().to_vec()
        })
        .unwrap_or_default()
}
