use crate::{
    api::{
        self,
        handlers::auth::{AuthConfig, OAuthConfig, ProviderCredentials},
    },
    cli::commands::oauth::ProviderPair,
};
use anyhow::Result;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub public_base_url: String,
    pub session_ttl_seconds: u64,
    pub session_sweep_seconds: u64,
    pub login_failure_delay_seconds: u64,
    pub request_limit: usize,
    pub request_window_seconds: u64,
    pub trusted_proxies: Vec<IpAddr>,
    pub google: Option<ProviderPair>,
    pub github: Option<ProviderPair>,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig::new(self.public_base_url.clone())
            .with_session_ttl_seconds(self.session_ttl_seconds)
            .with_session_sweep_seconds(self.session_sweep_seconds)
            .with_login_failure_delay(Duration::from_secs(self.login_failure_delay_seconds))
            .with_request_limit(self.request_limit, self.request_window_seconds)
            .with_trusted_proxies(self.trusted_proxies.clone())
    }

    fn oauth_config(&mut self) -> OAuthConfig {
        let credentials =
            |pair: ProviderPair| ProviderCredentials::new(pair.client_id, pair.client_secret);

        let mut config = OAuthConfig::default();
        if let Some(google) = self.google.take() {
            config = config.with_google(credentials(google));
        }
        if let Some(github) = self.github.take() {
            config = config.with_github(credentials(github));
        }
        config
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(mut args: Args) -> Result<()> {
    let auth_config = args.auth_config();
    let oauth_config = args.oauth_config();
    debug!("Auth config: {auth_config:?}");

    info!(
        "Starting pordisto {} on port {}",
        env!("CARGO_PKG_VERSION"),
        args.port
    );

    api::new(args.port, args.dsn, auth_config, oauth_config).await
}
