use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_MAGIC_LINK_TTL_SECONDS: &str = "magic-link-ttl-seconds";
pub const ARG_BOT_API_KEY: &str = "bot-api-key";
pub const ARG_HOST_BOT_TOKEN: &str = "host-bot-token";
pub const ARG_INIT_DATA_MAX_AGE_SECONDS: &str = "init-data-max-age-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAGIC_LINK_TTL_SECONDS)
                .long(ARG_MAGIC_LINK_TTL_SECONDS)
                .help("Magic link lifetime in seconds")
                .env("TESSERA_MAGIC_LINK_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_BOT_API_KEY)
                .long(ARG_BOT_API_KEY)
                .help("Key the bot presents to request magic links; issuance is disabled without it")
                .env("TESSERA_BOT_API_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_HOST_BOT_TOKEN)
                .long(ARG_HOST_BOT_TOKEN)
                .help("Bot token used to verify embedded host init data; embedded login is disabled without it")
                .env("TESSERA_HOST_BOT_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_INIT_DATA_MAX_AGE_SECONDS)
                .long(ARG_INIT_DATA_MAX_AGE_SECONDS)
                .help("Maximum age of embedded host init data in seconds")
                .env("TESSERA_INIT_DATA_MAX_AGE_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub ttl_seconds: i64,
    pub bot_api_key: Option<SecretString>,
    pub host_bot_token: Option<SecretString>,
    pub init_data_max_age_seconds: i64,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let get_secret = |id: &str| {
            matches
                .get_one::<String>(id)
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::from(v.clone()))
        };

        Self {
            ttl_seconds: matches
                .get_one::<i64>(ARG_MAGIC_LINK_TTL_SECONDS)
                .copied()
                .unwrap_or(600),
            bot_api_key: get_secret(ARG_BOT_API_KEY),
            host_bot_token: get_secret(ARG_HOST_BOT_TOKEN),
            init_data_max_age_seconds: matches
                .get_one::<i64>(ARG_INIT_DATA_MAX_AGE_SECONDS)
                .copied()
                .unwrap_or(86_400),
        }
    }
}
