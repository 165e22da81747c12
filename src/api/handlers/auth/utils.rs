//! Small helpers for opaque token generation, hashing and header parsing.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Create a new one-time magic token.
/// The raw value is only returned to the caller; the store keeps a hash.
pub(crate) fn generate_magic_token() -> Result<String, rand::Error> {
    random_url_safe(32)
}

/// Create a new security stamp for an identity.
pub(crate) fn generate_security_stamp() -> Result<String, rand::Error> {
    random_url_safe(16)
}

fn random_url_safe(len: usize) -> Result<String, rand::Error> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash a token so raw values never touch the database.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Compare two secrets through their digests so timing does not track the raw bytes.
pub(crate) fn secrets_match(presented: &str, expected: &str) -> bool {
    hash_token(presented) == hash_token(expected)
}

/// Read `Authorization: Bearer <token>`.
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Accept only same-origin absolute paths as post-login redirect targets.
pub(crate) fn safe_redirect_target(target: Option<&str>) -> String {
    match target.map(str::trim) {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}
