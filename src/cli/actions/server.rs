use crate::{
    api::{
        self,
        handlers::auth::{cookie::TunnelHosts, SessionConfig, TtlTiers},
    },
    cli::commands::{links, session},
};
use anyhow::{anyhow, ensure, Context, Result};
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub session: session::Options,
    pub links: links::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the session configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);
    let session_config = session_config(&args)?;
    api::new(args.port, args.dsn, session_config).await
}

/// Turn parsed flags into the immutable session configuration.
///
/// # Errors
/// Returns an error for a short secret, a bad base URL, login path, tier list or
/// tunnel pattern.
pub fn session_config(args: &Args) -> Result<SessionConfig> {
    let tiers = match &args.session.ttl_tiers {
        Some(overrides) => TtlTiers::default()
            .with_overrides(overrides)
            .map_err(|err| anyhow!("invalid --{}: {err}", session::ARG_SESSION_TTL_TIERS))?,
        None => TtlTiers::default(),
    };

    let login_path = args.session.login_path.trim().to_string();
    ensure!(
        login_path.starts_with('/') && !login_path.starts_with("//"),
        "--{} must be an absolute path, got '{login_path}'",
        session::ARG_LOGIN_PATH
    );

    let mut config = SessionConfig::new(
        args.session.secret.clone(),
        args.session.public_base_url.clone(),
    )
    .map_err(|err| anyhow!(err))?
    .with_ttl_tiers(tiers)
    .with_identity_cache_seconds(args.session.identity_cache_seconds)
    .with_login_path(login_path)
    .with_cookie_domain(args.session.cookie_domain.clone())
    .with_magic_link_ttl_seconds(args.links.ttl_seconds)
    .with_bot_api_key(args.links.bot_api_key.clone())
    .with_host_bot_token(args.links.host_bot_token.clone())
    .with_init_data_max_age_seconds(args.links.init_data_max_age_seconds);

    if let Some(patterns) = &args.session.tunnel_host_patterns {
        let hosts = TunnelHosts::parse(patterns).with_context(|| {
            format!("invalid --{}", session::ARG_TUNNEL_HOST_PATTERNS)
        })?;
        config = config.with_tunnel_hosts(hosts);
    }

    Ok(config)
}

fn log_startup_args(args: &Args) {
    let set_or_unset = |set: bool| if set { "set" } else { "unset" }.to_string();
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("public_base_url", args.session.public_base_url.clone()),
        ("login_path", args.session.login_path.clone()),
        (
            "session_ttl_tiers",
            args.session
                .ttl_tiers
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        ),
        (
            "identity_cache_seconds",
            args.session.identity_cache_seconds.to_string(),
        ),
        (
            "cookie_domain",
            args.session
                .cookie_domain
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        ),
        (
            "tunnel_host_patterns",
            args.session
                .tunnel_host_patterns
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        ),
        ("magic_link_ttl_seconds", args.links.ttl_seconds.to_string()),
        ("bot_api_key", set_or_unset(args.links.bot_api_key.is_some())),
        (
            "host_bot_token",
            set_or_unset(args.links.host_bot_token.is_some()),
        ),
        (
            "init_data_max_age_seconds",
            args.links.init_data_max_age_seconds.to_string(),
        ),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} - {} - {}\n\n{title}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
