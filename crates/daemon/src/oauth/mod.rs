//! OAuth bridge
//!
//! One identity provider is installed at startup. Browser logins get a short-lived
//! state from [`OAuthStates`]; enrollment flows reuse their session cache state, so a
//! callback either redirects to the dashboard or completes the waiting session.

mod azure;
mod github;
mod google;
mod oidc;

pub use azure::AzureAdProvider;
pub use github::GithubProvider;
pub use google::GoogleProvider;
pub use oidc::OidcProvider;

use crate::auth::{Claims, JwtManager, UserStore};
use crate::config::OAuthConfig;
use crate::session_cache::{SessionCache, SessionKind, SessionStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wgmesh_common::{Error, Result};

/// Bound on every exchange with the identity provider
pub const OAUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Lifetime of a browser login state
pub const STATE_TTL: Duration = Duration::from_secs(600);
const STATE_BYTES: usize = 16;

/// Identity as reported by a provider, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Local user name: email, login or UPN depending on the provider
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Google,
    Github,
    AzureAd,
    Oidc,
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "github" => Ok(ProviderKind::Github),
            "azure-ad" | "azure" => Ok(ProviderKind::AzureAd),
            "oidc" => Ok(ProviderKind::Oidc),
            other => Err(Error::validation(format!("unknown OAuth provider {:?}", other))),
        }
    }
}

/// Client registration shared by every provider
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub redirect_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Where a provider lives. Overridable so tests can point at a mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provider URL the browser is sent to for `state`
    fn auth_url(&self, state: &str) -> String;

    /// Exchange `code`, verify the token and fetch the user
    async fn user_info(&self, code: &str) -> Result<Principal>;
}

/// Build the configured provider, running discovery where needed
pub async fn init_provider(
    config: &OAuthConfig,
    redirect_url: String,
) -> Result<Option<Arc<dyn OAuthProvider>>> {
    let Some(name) = config.provider.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    let kind: ProviderKind = name.parse()?;
    let settings = ProviderSettings {
        redirect_url,
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
    };
    if settings.client_id.is_empty() || settings.client_secret.is_empty() {
        return Err(Error::validation("OAuth client id and secret are required"));
    }
    let http = http_client()?;

    let provider: Arc<dyn OAuthProvider> = match kind {
        ProviderKind::Google => Arc::new(GoogleProvider::new(settings, http)),
        ProviderKind::Github => Arc::new(GithubProvider::new(settings, http)),
        ProviderKind::AzureAd => {
            let tenant = config.azure_tenant.clone().unwrap_or_else(|| "common".into());
            Arc::new(AzureAdProvider::new(settings, &tenant, http))
        }
        ProviderKind::Oidc => {
            let issuer = config
                .oidc_issuer
                .clone()
                .ok_or_else(|| Error::validation("OIDC_ISSUER is required for the oidc provider"))?;
            Arc::new(OidcProvider::discover(settings, &issuer, http).await?)
        }
    };

    info!("OAuth provider {:?} initialized", kind);
    Ok(Some(provider))
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(OAUTH_TIMEOUT)
        .user_agent(concat!("wgmesh/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Internal(format!("http client: {}", e)))
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Authorization-code exchange (RFC 6749 section 4.1.3)
pub(crate) async fn exchange_code(
    http: &reqwest::Client,
    token_url: &str,
    settings: &ProviderSettings,
    code: &str,
) -> Result<TokenResponse> {
    let response = http
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", settings.redirect_url.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
        ])
        .send()
        .await
        .map_err(upstream)?;

    if !response.status().is_success() {
        return Err(Error::Unauthorized(format!(
            "token exchange failed with {}",
            response.status()
        )));
    }
    let token: TokenResponse = response.json().await.map_err(upstream)?;
    if token.access_token.is_empty() {
        return Err(Error::Unauthorized("provider returned an empty token".into()));
    }
    Ok(token)
}

/// GET a JSON document with a bearer token
pub(crate) async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<T> {
    let response = http
        .get(url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(upstream)?;
    if !response.status().is_success() {
        return Err(Error::Upstream(format!("{} returned {}", url, response.status())));
    }
    response.json().await.map_err(upstream)
}

pub(crate) fn authorize_url(
    base: &str,
    settings: &ProviderSettings,
    scopes: &str,
    state: &str,
) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        base,
        separator,
        urlencoding::encode(&settings.client_id),
        urlencoding::encode(&settings.redirect_url),
        urlencoding::encode(scopes),
        urlencoding::encode(state),
    )
}

pub(crate) fn upstream(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            seconds: OAUTH_TIMEOUT.as_secs(),
        }
    } else {
        Error::Upstream(e.to_string())
    }
}

/// Fresh random state: 16 bytes, hex encoded
pub fn new_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Server-wide store of issued browser login states
#[derive(Clone, Default)]
pub struct OAuthStates {
    issued: Arc<DashMap<String, Instant>>,
}

impl OAuthStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> String {
        let state = new_state();
        self.issued.insert(state.clone(), Instant::now() + STATE_TTL);
        state
    }

    /// Consume a state. Unknown states are a validation error, stale ones `Expired`.
    pub fn take(&self, state: &str) -> Result<()> {
        match self.issued.remove(state) {
            None => Err(Error::validation("unknown OAuth state")),
            Some((_, expires_at)) if expires_at <= Instant::now() => {
                Err(Error::Expired("OAuth state expired".into()))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn contains(&self, state: &str) -> bool {
        self.issued.contains_key(state)
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.issued.retain(|_, expires_at| *expires_at > now);
    }
}

/// Result of a handled callback
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// Browser login: send the user to the dashboard
    Redirect(String),
    /// An enrollment session was completed; show a landing page
    Completed { user: String },
}

/// Entry point for logins and callbacks
#[derive(Clone)]
pub struct OAuthBridge {
    provider: Arc<OnceCell<Arc<dyn OAuthProvider>>>,
    states: OAuthStates,
    sessions: SessionCache,
    users: UserStore,
    jwt: JwtManager,
    frontend_url: String,
}

impl OAuthBridge {
    pub fn new(
        sessions: SessionCache,
        users: UserStore,
        jwt: JwtManager,
        frontend_url: &str,
    ) -> Self {
        Self {
            provider: Arc::new(OnceCell::new()),
            states: OAuthStates::new(),
            sessions,
            users,
            jwt,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
        }
    }

    /// Install the provider. Only the first call succeeds.
    pub fn install(&self, provider: Arc<dyn OAuthProvider>) -> Result<()> {
        let kind = provider.kind();
        self.provider
            .set(provider)
            .map_err(|_| Error::conflict("an OAuth provider is already installed"))?;
        debug!("Installed OAuth provider {:?}", kind);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.provider.get().is_some()
    }

    pub fn states(&self) -> &OAuthStates {
        &self.states
    }

    fn provider(&self) -> Result<&Arc<dyn OAuthProvider>> {
        self.provider
            .get()
            .ok_or_else(|| Error::validation("OAuth is not configured"))
    }

    /// Start a browser login, returning the provider URL
    pub fn login(&self) -> Result<String> {
        let provider = self.provider()?;
        let state = self.states.issue();
        Ok(provider.auth_url(&state))
    }

    /// Provider URL for an enrollment session waiting under `state`
    pub fn register_url(&self, state: &str) -> Result<String> {
        let provider = self.provider()?;
        self.sessions.get(state)?;
        Ok(provider.auth_url(state))
    }

    pub async fn callback(&self, state: &str, code: &str) -> Result<CallbackOutcome> {
        if state.is_empty() || code.is_empty() {
            return Err(Error::validation("missing state or code"));
        }
        let provider = self.provider()?.clone();

        let session = match self.sessions.get(state) {
            Ok(session) => Some(session),
            Err(Error::NotFound { .. }) => {
                self.states.take(state)?;
                None
            }
            Err(e) => return Err(e),
        };

        let principal = match provider.user_info(code).await {
            Ok(principal) => principal,
            Err(e) => {
                warn!("OAuth user lookup failed: {}", e);
                if session.is_some() {
                    self.fail_session(state, &e);
                }
                return Err(e);
            }
        };

        match session {
            None => self.finish_browser_login(&principal),
            Some(session) => {
                let result = self.finish_session(
                    state,
                    session.kind,
                    session.network.as_deref(),
                    &principal,
                );
                if let Err(e) = &result {
                    self.fail_session(state, e);
                }
                result
            }
        }
    }

    fn finish_browser_login(&self, principal: &Principal) -> Result<CallbackOutcome> {
        let user = self.users.resolve_oauth(&principal.user_id)?;
        let token = self.jwt.issue(&Claims::for_user(&user))?;
        info!("OAuth login by {}", user.username);
        Ok(CallbackOutcome::Redirect(format!(
            "{}/login?login={}&user={}",
            self.frontend_url,
            token,
            urlencoding::encode(&user.username)
        )))
    }

    fn finish_session(
        &self,
        state: &str,
        kind: SessionKind,
        network: Option<&str>,
        principal: &Principal,
    ) -> Result<CallbackOutcome> {
        let user = self.users.resolve_oauth(&principal.user_id)?;

        let status = match kind {
            SessionKind::HostJoin => user.username.clone(),
            SessionKind::Headless => {
                format!("JWT: {}", self.jwt.issue(&Claims::for_user(&user))?)
            }
            SessionKind::NodeSso => {
                let network = network.unwrap_or_default();
                if !user.can_access(network) {
                    return Err(Error::PermissionDenied(format!(
                        "user {} may not join network {}",
                        user.username, network
                    )));
                }
                format!(
                    "AccessToken: {}",
                    self.jwt.issue(&Claims::for_node(&user.username, network))?
                )
            }
        };

        let username = user.username.clone();
        self.sessions.update(state, |pending| {
            pending.user = Some(username);
            pending.status = SessionStatus::Completed(status);
        })?;

        info!("OAuth completed {:?} session for {}", kind, user.username);
        Ok(CallbackOutcome::Completed {
            user: user.username,
        })
    }

    fn fail_session(&self, state: &str, error: &Error) {
        let message = error.to_string();
        if let Err(e) = self
            .sessions
            .update(state, |pending| pending.status = SessionStatus::Failed(message))
        {
            debug!("Could not record OAuth failure for session: {}", e);
        }
    }
}
