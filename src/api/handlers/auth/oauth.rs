//! Google and GitHub sign-in.
//!
//! The only thing taken from a provider is a verified email address, which
//! is handed to [`IdentityFederator`](super::federation::IdentityFederator).
//! A random `state` value stored in a short-lived cookie guards the callback
//! against cross-site request forgery.

use axum::{
    extract::{Extension, Path, Query},
    http::{
        header::{LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};
use reqwest::{header::ACCEPT, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use url::Url;

use super::{
    error::AuthError,
    state::AuthState,
    types::OAuthCallbackQuery,
    utils::{extract_cookie, generate_token},
};
use crate::{store::SessionSource, APP_USER_AGENT};

pub const OAUTH_STATE_COOKIE: &str = "pordisto_oauth_state";
const OAUTH_STATE_TTL_SECONDS: u64 = 10 * 60;
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_URL: &str = "https://api.github.com/user";
const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    Github,
}

impl OAuthProvider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Github => "github",
        }
    }

    const fn authorize_url(self) -> &'static str {
        match self {
            Self::Google => GOOGLE_AUTHORIZE_URL,
            Self::Github => GITHUB_AUTHORIZE_URL,
        }
    }

    const fn token_url(self) -> &'static str {
        match self {
            Self::Google => GOOGLE_TOKEN_URL,
            Self::Github => GITHUB_TOKEN_URL,
        }
    }

    const fn scope(self) -> &'static str {
        match self {
            Self::Google => "openid email profile",
            Self::Github => "user:email",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = OAuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            other => Err(OAuthError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {0} is not configured")]
    NotConfigured(OAuthProvider),
    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct ProviderCredentials {
    client_id: String,
    client_secret: SecretString,
}

impl ProviderCredentials {
    #[must_use]
    pub fn new(client_id: String, client_secret: SecretString) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }
}

/// Which providers are enabled. A provider without credentials is disabled.
#[derive(Clone, Debug, Default)]
pub struct OAuthConfig {
    google: Option<ProviderCredentials>,
    github: Option<ProviderCredentials>,
}

impl OAuthConfig {
    #[must_use]
    pub fn with_google(mut self, credentials: ProviderCredentials) -> Self {
        self.google = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_github(mut self, credentials: ProviderCredentials) -> Self {
        self.github = Some(credentials);
        self
    }

    #[must_use]
    pub fn credentials(&self, provider: OAuthProvider) -> Option<&ProviderCredentials> {
        match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::Github => self.github.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GoogleUserInfo {
    pub email: String,
    #[serde(default)]
    pub verified_email: bool,
}

#[derive(Debug, Deserialize)]
pub struct GithubUser {
    pub login: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GithubEmail {
    pub email: String,
    pub primary: bool,
    pub verified: bool,
}

/// Primary verified address from GitHub's `/user/emails` listing.
fn primary_verified(emails: Vec<GithubEmail>) -> Option<String> {
    emails
        .into_iter()
        .find(|entry| entry.primary && entry.verified)
        .map(|entry| entry.email)
}

pub struct OAuthClient {
    config: OAuthConfig,
    public_base_url: String,
    http: Client,
}

impl OAuthClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OAuthConfig, public_base_url: &str) -> Result<Self, OAuthError> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    #[must_use]
    pub fn is_enabled(&self, provider: OAuthProvider) -> bool {
        self.config.credentials(provider).is_some()
    }

    fn credentials(&self, provider: OAuthProvider) -> Result<&ProviderCredentials, OAuthError> {
        self.config
            .credentials(provider)
            .ok_or(OAuthError::NotConfigured(provider))
    }

    #[must_use]
    pub fn redirect_uri(&self, provider: OAuthProvider) -> String {
        format!("{}/auth/callback/{provider}", self.public_base_url)
    }

    /// # Errors
    /// `NotConfigured` when the provider has no credentials.
    pub fn authorize_url(&self, provider: OAuthProvider, state: &str) -> Result<Url, OAuthError> {
        let credentials = self.credentials(provider)?;
        let redirect_uri = self.redirect_uri(provider);
        let mut params = vec![
            ("client_id", credentials.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", provider.scope()),
            ("state", state),
        ];
        if provider == OAuthProvider::Google {
            params.push(("response_type", "code"));
        }
        Ok(Url::parse_with_params(provider.authorize_url(), &params)?)
    }

    /// Trade an authorization code for an access token.
    ///
    /// # Errors
    /// `Transport` on network failures, non-2xx replies or a body without
    /// `access_token`.
    pub async fn exchange_code(
        &self,
        provider: OAuthProvider,
        code: &str,
    ) -> Result<String, OAuthError> {
        let credentials = self.credentials(provider)?;
        let redirect_uri = self.redirect_uri(provider);
        let response: TokenResponse = self
            .http
            .post(provider.token_url())
            .header(ACCEPT, "application/json")
            .form(&[
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.expose_secret()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.access_token)
    }

    /// Fetch the account's verified email, `None` if the provider has none.
    ///
    /// # Errors
    /// `Transport` on network failures or unexpected payloads.
    pub async fn fetch_verified_email(
        &self,
        provider: OAuthProvider,
        access_token: &str,
    ) -> Result<Option<String>, OAuthError> {
        match provider {
            OAuthProvider::Google => {
                let info: GoogleUserInfo = self.get_json(GOOGLE_USERINFO_URL, access_token).await?;
                Ok(info.verified_email.then_some(info.email))
            }
            OAuthProvider::Github => {
                let user: GithubUser = self.get_json(GITHUB_USER_URL, access_token).await?;
                if let Some(email) = user.email.filter(|email| !email.trim().is_empty()) {
                    return Ok(Some(email));
                }
                let emails: Vec<GithubEmail> =
                    self.get_json(GITHUB_EMAILS_URL, access_token).await?;
                let email = primary_verified(emails);
                if email.is_none() {
                    warn!("GitHub account {} has no primary verified email", user.login);
                }
                Ok(email)
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, OAuthError> {
        Ok(self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

fn state_cookie(value: &str, max_age: u64) -> Result<HeaderValue, AuthError> {
    // Lax so the cookie survives the top-level redirect back from the provider.
    HeaderValue::from_str(&format!(
        "{OAUTH_STATE_COOKIE}={value}; Path=/auth; HttpOnly; Secure; SameSite=Lax; Max-Age={max_age}"
    ))
    .map_err(|err| AuthError::Internal(format!("invalid state cookie: {err}")))
}

fn unknown_provider(err: &OAuthError) -> Response {
    warn!("OAuth request rejected: {err}");
    (StatusCode::NOT_FOUND, "Unknown provider").into_response()
}

#[utoipa::path(
    get,
    path = "/auth/{provider}",
    params(("provider" = String, Path, description = "google or github")),
    responses(
        (status = 307, description = "Redirect to the provider's consent page"),
        (status = 404, description = "Provider unknown or not configured")
    ),
    tag = "auth"
)]
pub async fn oauth_start(
    Path(provider): Path<String>,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, AuthError> {
    let provider = match provider.parse::<OAuthProvider>() {
        Ok(provider) if auth_state.oauth().is_enabled(provider) => provider,
        Ok(provider) => return Ok(unknown_provider(&OAuthError::NotConfigured(provider))),
        Err(err) => return Ok(unknown_provider(&err)),
    };

    let csrf_state = generate_token()?;
    let location = match auth_state.oauth().authorize_url(provider, &csrf_state) {
        Ok(url) => url,
        Err(err) => return Ok(unknown_provider(&err)),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        LOCATION,
        HeaderValue::from_str(location.as_str())
            .map_err(|err| AuthError::Internal(format!("invalid authorize url: {err}")))?,
    );
    headers.insert(
        SET_COOKIE,
        state_cookie(&csrf_state, OAUTH_STATE_TTL_SECONDS)?,
    );
    Ok((StatusCode::TEMPORARY_REDIRECT, headers).into_response())
}

#[utoipa::path(
    get,
    path = "/auth/callback/{provider}",
    params(
        ("provider" = String, Path, description = "google or github"),
        OAuthCallbackQuery
    ),
    responses(
        (status = 303, description = "Signed in; redirect to /forum"),
        (status = 400, description = "State mismatch or missing code"),
        (status = 401, description = "Provider returned no verified email"),
        (status = 502, description = "Provider request failed")
    ),
    tag = "auth"
)]
pub async fn oauth_callback(
    Path(provider): Path<String>,
    Query(query): Query<OAuthCallbackQuery>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, AuthError> {
    let provider = match provider.parse::<OAuthProvider>() {
        Ok(provider) if auth_state.oauth().is_enabled(provider) => provider,
        Ok(provider) => return Ok(unknown_provider(&OAuthError::NotConfigured(provider))),
        Err(err) => return Ok(unknown_provider(&err)),
    };

    let expected = extract_cookie(&headers, OAUTH_STATE_COOKIE);
    if expected.is_none() || expected != query.state {
        warn!("OAuth callback for {provider} with mismatched state");
        return Ok((StatusCode::BAD_REQUEST, "Invalid OAuth state").into_response());
    }
    if let Some(reason) = query.error.as_deref() {
        warn!("OAuth provider {provider} returned error: {reason}");
    }
    let Some(code) = query.code.filter(|code| !code.is_empty()) else {
        return Ok((StatusCode::BAD_REQUEST, "Code not found").into_response());
    };

    let access_token = match auth_state.oauth().exchange_code(provider, &code).await {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to exchange {provider} code: {err}");
            return Ok((StatusCode::BAD_GATEWAY, "Failed to exchange token").into_response());
        }
    };
    let email = match auth_state
        .oauth()
        .fetch_verified_email(provider, &access_token)
        .await
    {
        Ok(Some(email)) => email,
        Ok(None) => {
            return Ok((StatusCode::UNAUTHORIZED, "No verified email from provider").into_response())
        }
        Err(err) => {
            error!("Failed to fetch {provider} user info: {err}");
            return Ok((StatusCode::BAD_GATEWAY, "Failed to get user info").into_response());
        }
    };

    let user_id = auth_state
        .federator()
        .resolve_external_identity(&email)
        .await?;
    let issued = auth_state
        .sessions()
        .create_session(user_id, SessionSource::Federated)
        .await?;
    info!("Federated login via {provider} for {user_id}");

    let mut response_headers = HeaderMap::new();
    response_headers.insert(LOCATION, HeaderValue::from_static("/forum"));
    response_headers.append(SET_COOKIE, auth_state.sessions().session_cookie(&issued)?);
    response_headers.append(SET_COOKIE, state_cookie("", 0)?);
    Ok((StatusCode::SEE_OTHER, response_headers).into_response())
}
