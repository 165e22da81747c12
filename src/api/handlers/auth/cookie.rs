//! Cookie attribute policy and session cookie encoding.
//!
//! Flow Overview: every time the session cookie is set or cleared, the policy is
//! recomputed from the request's forwarded host and protocol. HTTPS (or a known
//! development tunnel) gets `Secure; SameSite=None; Partitioned`, which browsers
//! require before an embedded third-party iframe may read the cookie. Plain local
//! HTTP falls back to `SameSite=Lax` without `Secure`.
//!
//! The same server answers on several hostnames (tunnel, production domain), so the
//! policy is never cached.

use axum::http::{
    header::{COOKIE, HOST, InvalidHeaderValue},
    HeaderMap, HeaderValue,
};
use regex::RegexSet;
use std::fmt;

/// Session cookie name.
pub const SESSION_COOKIE_NAME: &str = "tessera_session";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    None,
}

impl SameSite {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

/// Recognized development-tunnel hostnames.
#[derive(Clone)]
pub struct TunnelHosts {
    patterns: RegexSet,
}

impl TunnelHosts {
    #[must_use]
    pub fn new(patterns: RegexSet) -> Self {
        Self { patterns }
    }

    /// Compile host patterns from a comma-separated list of regexes.
    ///
    /// # Errors
    /// Returns an error if any pattern fails to compile.
    pub fn parse(list: &str) -> Result<Self, regex::Error> {
        let patterns: Vec<&str> = list
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .collect();
        RegexSet::new(patterns).map(Self::new)
    }

    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        self.patterns.is_match(host)
    }
}

impl fmt::Debug for TunnelHosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.patterns.patterns()).finish()
    }
}

/// Cookie attributes computed for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookiePolicy {
    pub secure: bool,
    pub same_site: SameSite,
    pub partitioned: bool,
    pub domain: Option<String>,
}

impl CookiePolicy {
    /// Resolve the policy from the forwarded host and protocol.
    #[must_use]
    pub fn resolve(
        forwarded_host: &str,
        forwarded_proto: &str,
        tunnels: &TunnelHosts,
        cookie_domain: Option<&str>,
    ) -> Self {
        let host = strip_port(forwarded_host.trim()).to_ascii_lowercase();
        let https = forwarded_proto.trim().eq_ignore_ascii_case("https") || tunnels.matches(&host);
        // The configured domain only applies when the request actually came in under it.
        let domain = cookie_domain
            .map(|domain| domain.trim_start_matches('.').to_ascii_lowercase())
            .filter(|domain| host == *domain || host.ends_with(&format!(".{domain}")));

        if https {
            Self {
                secure: true,
                same_site: SameSite::None,
                partitioned: true,
                domain,
            }
        } else {
            Self {
                secure: false,
                same_site: SameSite::Lax,
                partitioned: false,
                domain,
            }
        }
    }

    /// Resolve the policy from request headers (`X-Forwarded-*` first, then `Host`).
    #[must_use]
    pub fn from_headers(
        headers: &HeaderMap,
        tunnels: &TunnelHosts,
        cookie_domain: Option<&str>,
    ) -> Self {
        let host = first_header_value(headers, "x-forwarded-host")
            .or_else(|| first_header_value(headers, HOST.as_str()))
            .unwrap_or_default();
        let proto = first_header_value(headers, "x-forwarded-proto").unwrap_or("http");
        Self::resolve(host, proto, tunnels, cookie_domain)
    }

    fn attributes(&self) -> String {
        let mut attrs = format!("Path=/; HttpOnly; SameSite={}", self.same_site.as_str());
        if self.secure {
            attrs.push_str("; Secure");
        }
        if self.partitioned {
            attrs.push_str("; Partitioned");
        }
        if let Some(domain) = &self.domain {
            attrs.push_str("; Domain=");
            attrs.push_str(domain);
        }
        attrs
    }

    /// Build the `Set-Cookie` value carrying a session token.
    ///
    /// # Errors
    /// Returns an error if the token contains bytes invalid in a header.
    pub fn session_cookie(
        &self,
        token: &str,
        max_age_seconds: i64,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        let max_age = max_age_seconds.max(0);
        HeaderValue::from_str(&format!(
            "{SESSION_COOKIE_NAME}={token}; {}; Max-Age={max_age}",
            self.attributes()
        ))
    }

    /// Build the `Set-Cookie` value that clears the session cookie.
    ///
    /// # Errors
    /// Returns an error if the attributes are not a valid header value.
    pub fn clear_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!(
            "{SESSION_COOKIE_NAME}=; {}; Max-Age=0",
            self.attributes()
        ))
    }
}

fn first_header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

/// Read the session token from the `Cookie` header, if present.
pub(crate) fn session_cookie_value(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((key, val)) = pair.trim().split_once('=') else {
                continue;
            };
            if key.trim() == SESSION_COOKIE_NAME {
                let val = val.trim();
                if !val.is_empty() {
                    return Some(val.to_string());
                }
            }
        }
    }
    None
}
