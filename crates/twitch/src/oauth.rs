//! OAuth client for the platform identity service.
//!
//! Wraps `oauth2::BasicClient` for the authorization-code exchange and the
//! refresh exchange. Refresh failures are classified, not propagated blindly:
//! only a genuine invalid-refresh-grant response may increment the failure
//! ledger upstream, everything else is transient.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl,
    RefreshToken, RequestTokenError, Scope, StandardErrorResponse, TokenResponse, TokenUrl,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

const TWITCH_AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";
const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Seconds a pending authorization state stays valid.
const AUTH_STATE_TTL_SECS: i64 = 600;

/// Upper bound on any single identity-service exchange.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Scopes requested from broadcasters joining the partnership program.
pub const RAID_SCOPES: &[&str] = &[
    "channel:manage:raids",
    "moderator:read:followers",
    "channel:read:subscriptions",
    "channel:bot",
    "chat:read",
    "chat:edit",
];

#[derive(Debug, Error)]
pub enum TokenError {
    /// The refresh grant is no longer valid; counts toward the failure ledger.
    #[error("invalid refresh grant: {0}")]
    InvalidGrant(String),

    /// Network error, timeout, or 5xx. Retried on the next cycle.
    #[error("transient identity-service failure: {0}")]
    TransientRemote(String),

    /// The identity service rate limited us; skip this cycle.
    #[error("identity service rate limited the request")]
    RateLimited,
}

/// A successful token exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: u64,
    pub scopes: Vec<String>,
}

impl TokenGrant {
    fn from_response(response: &BasicTokenResponse) -> Self {
        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in_secs: response
                .expires_in()
                .map(|d| d.as_secs())
                .unwrap_or(3600),
            scopes: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
        }
    }
}

/// OAuth client bound to one application registration.
pub struct TwitchOAuth {
    client: BasicClient,
}

impl TwitchOAuth {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> anyhow::Result<Self> {
        Self::with_endpoints(
            client_id,
            client_secret,
            redirect_uri,
            TWITCH_AUTHORIZE_URL,
            TWITCH_TOKEN_URL,
        )
    }

    /// Construct against explicit endpoints. Production uses [`TwitchOAuth::new`];
    /// tests point this at a local mock server.
    pub fn with_endpoints(
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        authorize_url: &str,
        token_url: &str,
    ) -> anyhow::Result<Self> {
        let client = BasicClient::new(
            ClientId::new(client_id.to_owned()),
            Some(ClientSecret::new(client_secret.to_owned())),
            AuthUrl::new(authorize_url.to_owned())?,
            Some(TokenUrl::new(token_url.to_owned())?),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(RedirectUrl::new(redirect_uri.to_owned())?);

        Ok(Self { client })
    }

    /// Authorization URL a broadcaster visits to (re-)join the program.
    pub fn authorize_url(&self, state: &str) -> String {
        let (url, _) = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_owned()))
            .add_scopes(RAID_SCOPES.iter().map(|s| Scope::new((*s).to_string())))
            .add_extra_param("force_verify", "true")
            .url();
        url.to_string()
    }

    /// Exchange an authorization code for a fresh grant.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, TokenError> {
        let request = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(async_http_client);

        let response = tokio::time::timeout(TOKEN_REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| TokenError::TransientRemote("token exchange timed out".to_string()))?
            .map_err(classify)?;

        debug!("authorization code exchanged");
        Ok(TokenGrant::from_response(&response))
    }

    /// Exchange a refresh token for a new access/refresh pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        let refresh_token = RefreshToken::new(refresh_token.to_owned());
        let request = self
            .client
            .exchange_refresh_token(&refresh_token)
            .request_async(async_http_client);

        let response = tokio::time::timeout(TOKEN_REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| TokenError::TransientRemote("token refresh timed out".to_string()))?
            .map_err(classify)?;

        Ok(TokenGrant::from_response(&response))
    }
}

const INVALID_GRANT_MARKERS: &[&str] = &["invalid_grant", "invalid refresh token"];

fn contains_invalid_grant_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    INVALID_GRANT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Map an `oauth2` request error onto the §7-style categories.
///
/// The platform answers with two shapes: an RFC-6749 error object
/// (`{"error":"invalid_grant"}`) which parses into a server response, or its
/// own `{"status":400,"message":"Invalid refresh token"}` shape which fails
/// the RFC parse and surfaces as a parse error carrying the raw body. Both
/// must be recognised as an invalid grant.
fn classify<RE>(
    err: RequestTokenError<RE, StandardErrorResponse<BasicErrorResponseType>>,
) -> TokenError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            let description = response
                .error_description()
                .map(|d| d.as_str())
                .unwrap_or_default();
            match response.error() {
                BasicErrorResponseType::InvalidGrant => {
                    TokenError::InvalidGrant(format!("invalid_grant: {description}"))
                }
                BasicErrorResponseType::Extension(kind) => {
                    let lower = kind.to_lowercase();
                    if lower.contains("too many requests") {
                        TokenError::RateLimited
                    } else if contains_invalid_grant_marker(kind)
                        || contains_invalid_grant_marker(description)
                    {
                        TokenError::InvalidGrant(format!("{kind}: {description}"))
                    } else {
                        TokenError::TransientRemote(format!("{kind}: {description}"))
                    }
                }
                other => {
                    if contains_invalid_grant_marker(description) {
                        TokenError::InvalidGrant(description.to_string())
                    } else {
                        TokenError::TransientRemote(format!("{other:?}: {description}"))
                    }
                }
            }
        }
        RequestTokenError::Parse(_, body) => {
            let body = String::from_utf8_lossy(&body);
            if contains_invalid_grant_marker(&body) {
                TokenError::InvalidGrant(body.chars().take(300).collect())
            } else if body.to_lowercase().contains("too many requests") {
                TokenError::RateLimited
            } else {
                warn!(body = %body.chars().take(300).collect::<String>(),
                    "unparseable identity-service error payload");
                TokenError::TransientRemote(body.chars().take(300).collect())
            }
        }
        RequestTokenError::Request(err) => TokenError::TransientRemote(err.to_string()),
        RequestTokenError::Other(message) => TokenError::TransientRemote(message),
    }
}

/// Short-lived state tokens for pending authorization links.
///
/// The web callback lives outside this crate; it calls [`AuthStateStore::verify`]
/// with the `state` query parameter to recover which login the link was issued
/// for.
#[derive(Default)]
pub struct AuthStateStore {
    states: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl AuthStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh state token for a broadcaster login.
    pub fn issue(&self, twitch_login: &str) -> String {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(22)
            .map(char::from)
            .collect();

        self.states
            .lock()
            .expect("auth state lock poisoned")
            .insert(state.clone(), (twitch_login.to_lowercase(), Utc::now()));
        state
    }

    /// Consume a state token, returning the login it was issued for.
    pub fn verify(&self, state: &str) -> Option<String> {
        let mut states = self.states.lock().expect("auth state lock poisoned");
        let (login, issued_at) = states.remove(state)?;
        if (Utc::now() - issued_at).num_seconds() > AUTH_STATE_TTL_SECS {
            warn!(login, "authorization state expired");
            return None;
        }
        Some(login)
    }

    /// Drop expired states. Called from the periodic maintenance tick.
    pub fn cleanup(&self) {
        let mut states = self.states.lock().expect("auth state lock poisoned");
        let now = Utc::now();
        states.retain(|_, (_, issued_at)| (now - *issued_at).num_seconds() <= AUTH_STATE_TTL_SECS);
    }
}
