//! Session configuration and shared auth state.
//!
//! The configuration is built once from CLI flags and shared behind `Arc`; nothing
//! in it mutates after startup.

use regex::RegexSet;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{
    cookie::TunnelHosts,
    host_assertion::HostAssertionVerifier,
    magic_link::MagicLinkBroker,
    roles::Role,
    store::{CachedIdentityStore, IdentityStore, MagicTokenStore},
    token::TokenCodec,
    verifier::SessionVerifier,
};

/// Minimum accepted signing secret length in bytes.
pub const MIN_SECRET_BYTES: usize = 32;

const DEFAULT_MAGIC_LINK_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_IDENTITY_CACHE_SECONDS: u64 = 5;
const DEFAULT_INIT_DATA_MAX_AGE_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_LOGIN_PATH: &str = "/login";

pub const DEFAULT_TUNNEL_HOST_PATTERNS: [&str; 4] = [
    r"\.ngrok(-free)?\.(app|dev|io)$",
    r"\.trycloudflare\.com$",
    r"\.loca\.lt$",
    r"\.devtunnels\.ms$",
];

/// Session lifetime per role, shorter for higher privilege.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlTiers {
    tiers: BTreeMap<Role, i64>,
}

impl Default for TtlTiers {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            (Role::SuperAdmin, 60 * 60),
            (Role::PlatformManager, 4 * 60 * 60),
            (Role::PlatformSupport, 8 * 60 * 60),
            (Role::Owner, 7 * 24 * 60 * 60),
            (Role::Admin, 7 * 24 * 60 * 60),
            (Role::Agent, 3 * 24 * 60 * 60),
        ]);
        Self { tiers }
    }
}

impl TtlTiers {
    /// Build a table holding only the given entries; roles left out fall back to
    /// the shortest configured lifetime.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = (Role, i64)>) -> Self {
        Self {
            tiers: entries.into_iter().collect(),
        }
    }

    /// Parse `role=seconds` pairs separated by commas and apply them over the defaults.
    ///
    /// # Errors
    /// Returns an error for unknown roles or non-positive lifetimes.
    pub fn with_overrides(mut self, overrides: &str) -> Result<Self, String> {
        for pair in overrides.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (role, seconds) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected role=seconds, got '{pair}'"))?;
            let role = Role::parse(role).ok_or_else(|| format!("unknown role '{role}'"))?;
            let seconds: i64 = seconds
                .trim()
                .parse()
                .map_err(|_| format!("invalid seconds for {role}: '{seconds}'"))?;
            if seconds <= 0 {
                return Err(format!("session ttl for {role} must be positive"));
            }
            self.tiers.insert(role, seconds);
        }
        Ok(self)
    }

    /// Lifetime for `role`, falling back to the most conservative tier.
    #[must_use]
    pub fn ttl_seconds(&self, role: Role) -> i64 {
        self.tiers
            .get(&role)
            .copied()
            .unwrap_or_else(|| self.most_conservative())
    }

    #[must_use]
    pub fn most_conservative(&self) -> i64 {
        // An empty table still yields a short lifetime rather than an eternal one.
        self.tiers.values().copied().min().unwrap_or(15 * 60)
    }
}

#[derive(Clone)]
pub struct SessionConfig {
    secret: SecretString,
    ttl_tiers: TtlTiers,
    identity_cache_seconds: u64,
    magic_link_ttl_seconds: i64,
    public_base_url: String,
    login_path: String,
    tunnel_hosts: TunnelHosts,
    cookie_domain: Option<String>,
    bot_api_key: Option<SecretString>,
    host_bot_token: Option<SecretString>,
    init_data_max_age_seconds: i64,
}

impl SessionConfig {
    /// Create a configuration with default tiers and tunnel patterns.
    ///
    /// # Errors
    /// Returns an error if the secret is shorter than [`MIN_SECRET_BYTES`] or the
    /// public base URL is not an absolute http(s) URL.
    pub fn new(secret: SecretString, public_base_url: String) -> Result<Self, String> {
        if secret.expose_secret().len() < MIN_SECRET_BYTES {
            return Err(format!(
                "session secret must be at least {MIN_SECRET_BYTES} bytes"
            ));
        }
        let parsed = Url::parse(&public_base_url)
            .map_err(|err| format!("invalid public base URL '{public_base_url}': {err}"))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(format!(
                "public base URL must be an http(s) URL with a host: {public_base_url}"
            ));
        }
        let tunnel_hosts = TunnelHosts::new(RegexSet::new(DEFAULT_TUNNEL_HOST_PATTERNS).map_err(
            |err| format!("invalid default tunnel pattern: {err}"),
        )?);
        Ok(Self {
            secret,
            ttl_tiers: TtlTiers::default(),
            identity_cache_seconds: DEFAULT_IDENTITY_CACHE_SECONDS,
            magic_link_ttl_seconds: DEFAULT_MAGIC_LINK_TTL_SECONDS,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            tunnel_hosts,
            cookie_domain: None,
            bot_api_key: None,
            host_bot_token: None,
            init_data_max_age_seconds: DEFAULT_INIT_DATA_MAX_AGE_SECONDS,
        })
    }

    #[must_use]
    pub fn with_ttl_tiers(mut self, tiers: TtlTiers) -> Self {
        self.ttl_tiers = tiers;
        self
    }

    #[must_use]
    pub fn with_identity_cache_seconds(mut self, seconds: u64) -> Self {
        self.identity_cache_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_magic_link_ttl_seconds(mut self, seconds: i64) -> Self {
        self.magic_link_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: String) -> Self {
        self.login_path = path;
        self
    }

    #[must_use]
    pub fn with_tunnel_hosts(mut self, hosts: TunnelHosts) -> Self {
        self.tunnel_hosts = hosts;
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain.filter(|domain| !domain.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_bot_api_key(mut self, key: Option<SecretString>) -> Self {
        self.bot_api_key = key;
        self
    }

    #[must_use]
    pub fn with_host_bot_token(mut self, token: Option<SecretString>) -> Self {
        self.host_bot_token = token;
        self
    }

    #[must_use]
    pub fn with_init_data_max_age_seconds(mut self, seconds: i64) -> Self {
        self.init_data_max_age_seconds = seconds;
        self
    }

    pub(crate) fn secret(&self) -> &SecretString {
        &self.secret
    }

    #[must_use]
    pub fn ttl_tiers(&self) -> &TtlTiers {
        &self.ttl_tiers
    }

    #[must_use]
    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_seconds)
    }

    #[must_use]
    pub fn magic_link_ttl_seconds(&self) -> i64 {
        self.magic_link_ttl_seconds
    }

    #[must_use]
    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn tunnel_hosts(&self) -> &TunnelHosts {
        &self.tunnel_hosts
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    pub(crate) fn bot_api_key(&self) -> Option<&SecretString> {
        self.bot_api_key.as_ref()
    }

    pub(crate) fn host_bot_token(&self) -> Option<&SecretString> {
        self.host_bot_token.as_ref()
    }

    #[must_use]
    pub fn init_data_max_age_seconds(&self) -> i64 {
        self.init_data_max_age_seconds
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &"***")
            .field("ttl_tiers", &self.ttl_tiers)
            .field("identity_cache_seconds", &self.identity_cache_seconds)
            .field("magic_link_ttl_seconds", &self.magic_link_ttl_seconds)
            .field("public_base_url", &self.public_base_url)
            .field("login_path", &self.login_path)
            .field("tunnel_hosts", &self.tunnel_hosts)
            .field("cookie_domain", &self.cookie_domain)
            .field("bot_api_key", &self.bot_api_key.as_ref().map(|_| "***"))
            .field("host_bot_token", &self.host_bot_token.as_ref().map(|_| "***"))
            .field("init_data_max_age_seconds", &self.init_data_max_age_seconds)
            .finish()
    }
}

/// Everything the auth handlers need, wired once at startup.
pub struct AuthState {
    config: SessionConfig,
    codec: TokenCodec,
    identities: Arc<dyn IdentityStore>,
    verifier: SessionVerifier,
    broker: MagicLinkBroker,
    host_assertion: Option<HostAssertionVerifier>,
}

impl AuthState {
    pub fn new(
        config: SessionConfig,
        identities: Arc<dyn IdentityStore>,
        magic_tokens: Arc<dyn MagicTokenStore>,
    ) -> Self {
        let identities: Arc<dyn IdentityStore> = Arc::new(CachedIdentityStore::new(
            identities,
            config.identity_cache_ttl(),
        ));
        let codec = TokenCodec::new(config.secret().clone(), config.ttl_tiers().clone());
        let verifier = SessionVerifier::new(codec.clone(), identities.clone());
        let broker = MagicLinkBroker::new(magic_tokens, config.magic_link_ttl_seconds());
        let host_assertion = config.host_bot_token().map(|token| {
            HostAssertionVerifier::new(token.clone(), config.init_data_max_age_seconds())
        });
        Self {
            config,
            codec,
            identities,
            verifier,
            broker,
            host_assertion,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    #[must_use]
    pub fn identities(&self) -> &dyn IdentityStore {
        self.identities.as_ref()
    }

    #[must_use]
    pub fn verifier(&self) -> &SessionVerifier {
        &self.verifier
    }

    #[must_use]
    pub fn broker(&self) -> &MagicLinkBroker {
        &self.broker
    }

    pub(crate) fn host_assertion(&self) -> Option<&HostAssertionVerifier> {
        self.host_assertion.as_ref()
    }
}
