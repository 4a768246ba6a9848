//! Maps parsed CLI arguments to the action the binary runs.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, oauth, ARG_DSN, ARG_PORT};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;
    let oauth_opts = oauth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        public_base_url: auth_opts.public_base_url,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        session_sweep_seconds: auth_opts.session_sweep_seconds,
        login_failure_delay_seconds: auth_opts.login_failure_delay_seconds,
        request_limit: auth_opts.request_limit,
        request_window_seconds: auth_opts.request_window_seconds,
        trusted_proxies: auth_opts.trusted_proxies,
        google: oauth_opts.google,
        github: oauth_opts.github,
    }))
}
