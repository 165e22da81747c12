use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_SESSION_TTL_TIERS: &str = "session-ttl-tiers";
pub const ARG_IDENTITY_CACHE_SECONDS: &str = "identity-cache-seconds";
pub const ARG_PUBLIC_BASE_URL: &str = "public-base-url";
pub const ARG_LOGIN_PATH: &str = "login-path";
pub const ARG_TUNNEL_HOST_PATTERNS: &str = "tunnel-host-patterns";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("Secret used to sign session tokens (at least 32 bytes)")
                .env("TESSERA_SESSION_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_TIERS)
                .long(ARG_SESSION_TTL_TIERS)
                .help("Session lifetime overrides per role, e.g. super_admin=1800,agent=86400")
                .env("TESSERA_SESSION_TTL_TIERS"),
        )
        .arg(
            Arg::new(ARG_IDENTITY_CACHE_SECONDS)
                .long(ARG_IDENTITY_CACHE_SECONDS)
                .help("How long identity lookups are cached; bounds revocation delay")
                .env("TESSERA_IDENTITY_CACHE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(0..=60)),
        )
        .arg(
            Arg::new(ARG_PUBLIC_BASE_URL)
                .long(ARG_PUBLIC_BASE_URL)
                .help("Public base URL used for magic links and the CORS origin")
                .env("TESSERA_PUBLIC_BASE_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_LOGIN_PATH)
                .long(ARG_LOGIN_PATH)
                .help("Path failed magic link redemptions are sent to")
                .env("TESSERA_LOGIN_PATH")
                .default_value("/login"),
        )
        .arg(
            Arg::new(ARG_TUNNEL_HOST_PATTERNS)
                .long(ARG_TUNNEL_HOST_PATTERNS)
                .help("Comma separated regexes of tunnel hosts that always get cross-site cookies")
                .env("TESSERA_TUNNEL_HOST_PATTERNS"),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Cookie Domain attribute, applied only to requests under that domain")
                .env("TESSERA_COOKIE_DOMAIN"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub secret: SecretString,
    pub ttl_tiers: Option<String>,
    pub identity_cache_seconds: u64,
    pub public_base_url: String,
    pub login_path: String,
    pub tunnel_host_patterns: Option<String>,
    pub cookie_domain: Option<String>,
}

impl Options {
    /// Parse session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if required arguments are missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        // clap passes through empty strings when env vars are set to ""
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let Some(secret) = get_non_empty(ARG_SESSION_SECRET) else {
            anyhow::bail!("missing required argument: --{ARG_SESSION_SECRET}");
        };
        let Some(public_base_url) = get_non_empty(ARG_PUBLIC_BASE_URL) else {
            anyhow::bail!("missing required argument: --{ARG_PUBLIC_BASE_URL}");
        };

        Ok(Self {
            secret: SecretString::from(secret),
            ttl_tiers: get_non_empty(ARG_SESSION_TTL_TIERS),
            identity_cache_seconds: matches
                .get_one::<u64>(ARG_IDENTITY_CACHE_SECONDS)
                .copied()
                .unwrap_or(5),
            public_base_url,
            login_path: get_non_empty(ARG_LOGIN_PATH).unwrap_or_else(|| "/login".to_string()),
            tunnel_host_patterns: get_non_empty(ARG_TUNNEL_HOST_PATTERNS),
            cookie_domain: get_non_empty(ARG_COOKIE_DOMAIN),
        })
    }
}
