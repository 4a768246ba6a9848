use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::net::IpAddr;
use url::Url;

pub const ARG_PUBLIC_BASE_URL: &str = "public-base-url";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_SESSION_SWEEP_SECONDS: &str = "session-sweep-seconds";
pub const ARG_LOGIN_FAILURE_DELAY_SECONDS: &str = "login-failure-delay-seconds";
pub const ARG_REQUEST_LIMIT: &str = "request-limit";
pub const ARG_REQUEST_WINDOW_SECONDS: &str = "request-window-seconds";
pub const ARG_TRUSTED_PROXIES: &str = "trusted-proxies";

#[derive(Debug)]
pub struct Options {
    pub public_base_url: String,
    pub session_ttl_seconds: u64,
    pub session_sweep_seconds: u64,
    pub login_failure_delay_seconds: u64,
    pub request_limit: usize,
    pub request_window_seconds: u64,
    pub trusted_proxies: Vec<IpAddr>,
}

impl Options {
    /// Parse session and throttling arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the public base URL is not an absolute http(s) URL.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let public_base_url = matches
            .get_one::<String>(ARG_PUBLIC_BASE_URL)
            .cloned()
            .context("missing required argument: --public-base-url")?;
        let parsed = Url::parse(&public_base_url)
            .with_context(|| format!("Invalid public base URL: {public_base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            anyhow::bail!("Public base URL must be http(s) with a host: {public_base_url}");
        }

        let number = |id: &str, fallback: u64| matches.get_one::<u64>(id).copied().unwrap_or(fallback);

        Ok(Self {
            public_base_url,
            session_ttl_seconds: number(ARG_SESSION_TTL_SECONDS, 86_400),
            session_sweep_seconds: number(ARG_SESSION_SWEEP_SECONDS, 3_600),
            login_failure_delay_seconds: number(ARG_LOGIN_FAILURE_DELAY_SECONDS, 4),
            request_limit: matches
                .get_one::<usize>(ARG_REQUEST_LIMIT)
                .copied()
                .unwrap_or(30),
            request_window_seconds: number(ARG_REQUEST_WINDOW_SECONDS, 60),
            trusted_proxies: matches
                .get_many::<IpAddr>(ARG_TRUSTED_PROXIES)
                .map(|proxies| proxies.copied().collect())
                .unwrap_or_default(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    with_throttle_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PUBLIC_BASE_URL)
                .long(ARG_PUBLIC_BASE_URL)
                .help("Public base URL, used to build provider callback URLs")
                .env("PORDISTO_PUBLIC_BASE_URL")
                .default_value("https://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session lifetime in seconds")
                .env("PORDISTO_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_SWEEP_SECONDS)
                .long(ARG_SESSION_SWEEP_SECONDS)
                .help("Interval between expired session sweeps")
                .env("PORDISTO_SESSION_SWEEP_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_throttle_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOGIN_FAILURE_DELAY_SECONDS)
                .long(ARG_LOGIN_FAILURE_DELAY_SECONDS)
                .help("Delay applied after every failed credential check")
                .env("PORDISTO_LOGIN_FAILURE_DELAY_SECONDS")
                .default_value("4")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_REQUEST_LIMIT)
                .long(ARG_REQUEST_LIMIT)
                .help("Requests allowed per client and action within one window")
                .env("PORDISTO_REQUEST_LIMIT")
                .default_value("30")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_REQUEST_WINDOW_SECONDS)
                .long(ARG_REQUEST_WINDOW_SECONDS)
                .help("Sliding window length for the request limiter")
                .env("PORDISTO_REQUEST_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXIES)
                .long(ARG_TRUSTED_PROXIES)
                .help("Comma-separated proxy IPs whose X-Forwarded-For/X-Real-IP headers are honoured")
                .env("PORDISTO_TRUSTED_PROXIES")
                .value_delimiter(',')
                .value_parser(clap::value_parser!(IpAddr)),
        )
}
