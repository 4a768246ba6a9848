use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_GOOGLE_CLIENT_ID: &str = "google-client-id";
pub const ARG_GOOGLE_CLIENT_SECRET: &str = "google-client-secret";
pub const ARG_GITHUB_CLIENT_ID: &str = "github-client-id";
pub const ARG_GITHUB_CLIENT_SECRET: &str = "github-client-secret";

/// Client id and secret registered with an identity provider.
#[derive(Debug)]
pub struct ProviderPair {
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Debug, Default)]
pub struct Options {
    pub google: Option<ProviderPair>,
    pub github: Option<ProviderPair>,
}

impl Options {
    /// Parse provider credentials; a provider without both values stays disabled.
    ///
    /// # Errors
    /// Returns an error if only one half of a provider's credentials is set.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            google: pair(matches, ARG_GOOGLE_CLIENT_ID, ARG_GOOGLE_CLIENT_SECRET)?,
            github: pair(matches, ARG_GITHUB_CLIENT_ID, ARG_GITHUB_CLIENT_SECRET)?,
        })
    }
}

fn pair(matches: &ArgMatches, id_arg: &str, secret_arg: &str) -> Result<Option<ProviderPair>> {
    let read = |id: &str| {
        matches
            .get_one::<String>(id)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    match (read(id_arg), read(secret_arg)) {
        (Some(client_id), Some(secret)) => Ok(Some(ProviderPair {
            client_id,
            client_secret: SecretString::from(secret),
        })),
        (None, None) => Ok(None),
        (Some(_), None) => anyhow::bail!("missing required argument: --{secret_arg}"),
        (None, Some(_)) => anyhow::bail!("missing required argument: --{id_arg}"),
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GOOGLE_CLIENT_ID)
                .long(ARG_GOOGLE_CLIENT_ID)
                .help("Google OAuth client id; enables login with Google")
                .env("GOOGLE_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_GOOGLE_CLIENT_SECRET)
                .long(ARG_GOOGLE_CLIENT_SECRET)
                .help("Google OAuth client secret")
                .env("GOOGLE_CLIENT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_GITHUB_CLIENT_ID)
                .long(ARG_GITHUB_CLIENT_ID)
                .help("GitHub OAuth client id; enables login with GitHub")
                .env("GITHUB_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_GITHUB_CLIENT_SECRET)
                .long(ARG_GITHUB_CLIENT_SECRET)
                .help("GitHub OAuth client secret")
                .env("GITHUB_CLIENT_SECRET")
                .hide_env_values(true),
        )
}
