//! Helix API client: stream polling, user lookups, follower totals, and the
//! raid endpoint.
//!
//! Query endpoints authenticate with an app access token obtained through the
//! client-credentials grant and cached until shortly before expiry. The raid
//! endpoint always uses the acting broadcaster's user token.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const TWITCH_API_BASE: &str = "https://api.twitch.tv/helix";

/// Refresh the cached app token this long before it actually expires.
const APP_TOKEN_SLACK_SECS: i64 = 60;

const HELIX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum HelixError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("helix returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("app access token exchange failed: {0}")]
    AppToken(String),
}

/// Raid endpoint failures, split by whether another target is worth trying.
#[derive(Debug, Error)]
pub enum RaidError {
    /// The target's settings do not allow this raid; try the next candidate.
    #[error("target refused the raid: {0}")]
    TargetRefused(String),

    /// Anything else on the raid endpoint; the trigger is abandoned.
    #[error("raid endpoint failed: {0}")]
    ApiFatal(String),
}

/// Markers the platform uses when a target's settings reject raids.
const RAID_REFUSAL_MARKERS: &[&str] = &[
    "cannot be raided",
    "does not allow you to raid",
    "do not allow you to raid",
    "not allow you to raid",
    "not accepting raids",
    "does not allow raids",
    "raids are disabled",
];

fn is_raid_refusal(body: &str) -> bool {
    let lower = body.to_lowercase();
    RAID_REFUSAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// A live stream as returned by the streams endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    /// Platform-assigned stream id.
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    pub viewer_count: i64,
    pub started_at: String,
    #[serde(default)]
    pub language: String,
}

impl StreamInfo {
    /// Seconds since the stream started, zero if the timestamp is unparseable.
    pub fn duration_secs(&self) -> i64 {
        self.started_at
            .parse::<DateTime<Utc>>()
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct FollowersEnvelope {
    total: i64,
}

#[derive(Deserialize)]
struct AppTokenResponse {
    access_token: String,
    #[serde(default = "default_app_token_ttl")]
    expires_in: i64,
}

fn default_app_token_ttl() -> i64 {
    3600
}

struct CachedAppToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Helix client sharing one `reqwest::Client` connection pool.
pub struct HelixClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_url: String,
    app_token: Mutex<Option<CachedAppToken>>,
}

impl HelixClient {
    pub fn new(http: reqwest::Client, client_id: &str, client_secret: &str) -> Self {
        Self::with_endpoints(http, client_id, client_secret, TWITCH_API_BASE, TWITCH_TOKEN_URL)
    }

    /// Construct against explicit endpoints; tests point this at a mock server.
    pub fn with_endpoints(
        http: reqwest::Client,
        client_id: &str,
        client_secret: &str,
        api_base: &str,
        token_url: &str,
    ) -> Self {
        Self {
            http,
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            api_base: api_base.trim_end_matches('/').to_owned(),
            token_url: token_url.to_owned(),
            app_token: Mutex::new(None),
        }
    }

    /// Build the shared HTTP client used across all outbound components.
    pub fn default_http_client() -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent("streamnet-backend")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build shared http client")
    }

    async fn app_token(&self) -> Result<String, HelixError> {
        let mut cached = self.app_token.lock().await;

        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.expires_at - chrono::Duration::seconds(APP_TOKEN_SLACK_SECS) {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "app token exchange failed");
            return Err(HelixError::AppToken(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(300).collect::<String>()
            )));
        }

        let token: AppTokenResponse = response.json().await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in);
        debug!("app access token refreshed");

        *cached = Some(CachedAppToken {
            token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, HelixError> {
        let token = self.app_token().await?;
        let url = format!("{}{}", self.api_base, path);

        let response = self
            .http
            .get(&url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(&token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HelixError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        Ok(response.json().await?)
    }

    /// Streams currently live in a category, optionally filtered by language.
    pub async fn streams_by_category(
        &self,
        game_id: &str,
        language: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StreamInfo>, HelixError> {
        let mut query = vec![
            ("game_id".to_string(), game_id.to_string()),
            ("first".to_string(), limit.min(HELIX_PAGE_SIZE).to_string()),
        ];
        if let Some(language) = language {
            query.push(("language".to_string(), language.to_string()));
        }

        let envelope: DataEnvelope<StreamInfo> = self.get_json("/streams", &query).await?;
        Ok(envelope.data)
    }

    /// Live streams for an explicit set of logins, batched per Helix page size.
    pub async fn streams_by_logins(&self, logins: &[String]) -> Result<Vec<StreamInfo>, HelixError> {
        let mut streams = Vec::new();

        for chunk in logins.chunks(HELIX_PAGE_SIZE) {
            let query: Vec<(String, String)> = chunk
                .iter()
                .map(|login| ("user_login".to_string(), login.to_lowercase()))
                .collect();

            let envelope: DataEnvelope<StreamInfo> = self.get_json("/streams", &query).await?;
            streams.extend(envelope.data);
        }

        Ok(streams)
    }

    pub async fn users_by_logins(&self, logins: &[String]) -> Result<Vec<UserInfo>, HelixError> {
        let mut users = Vec::new();

        for chunk in logins.chunks(HELIX_PAGE_SIZE) {
            let query: Vec<(String, String)> = chunk
                .iter()
                .map(|login| ("login".to_string(), login.to_lowercase()))
                .collect();

            let envelope: DataEnvelope<UserInfo> = self.get_json("/users", &query).await?;
            users.extend(envelope.data);
        }

        Ok(users)
    }

    /// The account a user access token belongs to. Used after a code exchange
    /// to learn which broadcaster authorized us.
    pub async fn current_user(&self, user_token: &str) -> Result<UserInfo, HelixError> {
        let url = format!("{}/users", self.api_base);

        let response = self
            .http
            .get(&url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(user_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HelixError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }

        let envelope: DataEnvelope<UserInfo> = response.json().await?;
        envelope.data.into_iter().next().ok_or(HelixError::Status {
            status: status.as_u16(),
            body: "users endpoint returned no rows for token".to_string(),
        })
    }

    /// Follower total for a broadcaster, best-effort. Requires a user token
    /// carrying `moderator:read:followers`; callers treat `None` as unknown.
    pub async fn followers_total(
        &self,
        broadcaster_id: &str,
        user_token: &str,
    ) -> Option<i64> {
        let url = format!("{}/channels/followers", self.api_base);

        let response = self
            .http
            .get(&url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(user_token)
            .query(&[("broadcaster_id", broadcaster_id), ("first", "1")])
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!(
                broadcaster_id,
                status = response.status().as_u16(),
                "followers lookup failed"
            );
            return None;
        }

        let envelope: FollowersEnvelope = response.json().await.ok()?;
        Some(envelope.total)
    }

    /// Start a raid from one broadcaster to another.
    pub async fn start_raid(
        &self,
        from_broadcaster_id: &str,
        to_broadcaster_id: &str,
        user_token: &str,
    ) -> Result<(), RaidError> {
        let url = format!("{}/raids", self.api_base);

        let response = self
            .http
            .post(&url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(user_token)
            .query(&[
                ("from_broadcaster_id", from_broadcaster_id),
                ("to_broadcaster_id", to_broadcaster_id),
            ])
            .send()
            .await
            .map_err(|e| RaidError::ApiFatal(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!(
            "HTTP {}: {}",
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        );

        if is_raid_refusal(&body) {
            warn!(to_broadcaster_id, "raid target refused");
            return Err(RaidError::TargetRefused(message));
        }

        Err(RaidError::ApiFatal(message))
    }
}
