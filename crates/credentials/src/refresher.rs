//! Background token refresher.
//!
//! Every thirty minutes the loop scans enabled grants and refreshes any token
//! expiring within the next two hours. The same locked path runs
//! opportunistically whenever a consumer asks for a valid token inside the
//! five-minute safety window, so callers never receive a token that expires
//! mid-request.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use streamnet_twitch::{AuthStateStore, TokenError, TwitchOAuth};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::notify::PartnerNotifier;
use crate::repository::CredentialRepository;
use crate::types::{CredentialError, CredentialResult};

/// Interval between background scans.
const REFRESH_CYCLE: StdDuration = StdDuration::from_secs(30 * 60);

/// Refresh a grant once its expiry is within this horizon.
const PRE_EXPIRY_HORIZON_HOURS: i64 = 2;

/// Consumers never get a token closer than this to its expiry.
const SAFETY_WINDOW_MINUTES: i64 = 5;

/// Pause between successive background refreshes, keeps the identity service
/// off our back during large scans.
const INTER_REFRESH_DELAY: StdDuration = StdDuration::from_millis(500);

pub struct TokenRefresher {
    repo: CredentialRepository,
    oauth: Arc<TwitchOAuth>,
    notifier: Arc<dyn PartnerNotifier>,
    auth_states: Arc<AuthStateStore>,
    /// Process-wide refresh lock; all refresh paths serialize here.
    refresh_lock: Mutex<()>,
}

impl TokenRefresher {
    pub fn new(
        repo: CredentialRepository,
        oauth: Arc<TwitchOAuth>,
        notifier: Arc<dyn PartnerNotifier>,
        auth_states: Arc<AuthStateStore>,
    ) -> Self {
        Self {
            repo,
            oauth,
            notifier,
            auth_states,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Background loop. Exits after the current iteration once `shutdown`
    /// flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REFRESH_CYCLE) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("token refresher stopping");
                        return;
                    }
                    continue;
                }
            }

            match self.run_once().await {
                Ok(0) => debug!("refresh cycle complete, nothing to do"),
                Ok(count) => info!(count, "refresh cycle complete"),
                Err(err) => error!(?err, "refresh cycle failed"),
            }

            self.auth_states.cleanup();
        }
    }

    /// One scan over all enabled grants. Returns how many were refreshed.
    pub async fn run_once(&self) -> CredentialResult<usize> {
        let grants = self.repo.enabled_grants().await?;
        let horizon = Duration::hours(PRE_EXPIRY_HORIZON_HOURS);
        let mut refreshed = 0usize;

        for grant in grants {
            if Utc::now() < grant.expires_at - horizon {
                continue;
            }
            if self.repo.is_blacklisted(&grant.twitch_user_id).await? {
                continue;
            }
            if self.repo.has_recent_failure(&grant.twitch_user_id).await? {
                debug!(login = %grant.twitch_login, "skipping refresh, cooldown active");
                continue;
            }

            match self
                .refresh_locked(&grant.twitch_user_id, &grant.twitch_login, horizon)
                .await
            {
                Ok(true) => {
                    refreshed += 1;
                    tokio::time::sleep(INTER_REFRESH_DELAY).await;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(login = %grant.twitch_login, ?err, "background refresh failed");
                }
            }
        }

        Ok(refreshed)
    }

    /// Return an access token guaranteed to outlive the safety window, or
    /// `None` when the broadcaster is blacklisted, cooling down, or has no
    /// usable grant.
    pub async fn get_valid_token(
        &self,
        twitch_user_id: &str,
    ) -> CredentialResult<Option<String>> {
        if self.repo.is_blacklisted(twitch_user_id).await? {
            warn!(user_id = twitch_user_id, "grant blacklisted, refusing token");
            return Ok(None);
        }
        if self.repo.has_recent_failure(twitch_user_id).await? {
            debug!(user_id = twitch_user_id, "refresh cooldown active, refusing token");
            return Ok(None);
        }

        let grant = match self.repo.load_grant(twitch_user_id).await {
            Ok(grant) => grant,
            Err(CredentialError::GrantNotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let safety = Duration::minutes(SAFETY_WINDOW_MINUTES);
        if grant.valid_for(safety) {
            return Ok(Some(grant.access_token));
        }

        let login = grant.twitch_login.clone();
        match self.refresh_locked(twitch_user_id, &login, safety).await {
            Ok(_) => {}
            Err(err) => {
                warn!(login = %login, ?err, "inline refresh failed");
                return Ok(None);
            }
        }

        // Re-read: either the winner of the lock race or this call refreshed.
        // A failed refresh leaves the old expiry behind; never hand that out.
        match self.repo.load_grant(twitch_user_id).await {
            Ok(grant) if grant.expires_at > Utc::now() => Ok(Some(grant.access_token)),
            Ok(_) => Ok(None),
            Err(CredentialError::GrantNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The single refresh path. Serialized by the process-wide mutex; losers
    /// re-read the expiry after acquisition and may find the winner already
    /// refreshed.
    ///
    /// Returns `Ok(true)` when this call performed the refresh.
    async fn refresh_locked(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        horizon: Duration,
    ) -> CredentialResult<bool> {
        let _guard = self.refresh_lock.lock().await;

        // Double-check under the lock.
        match self.repo.current_expiry(twitch_user_id).await? {
            None => return Ok(false),
            Some(expiry) if Utc::now() < expiry - horizon => return Ok(false),
            Some(_) => {}
        }

        let grant = self.repo.load_grant(twitch_user_id).await?;

        debug!(login = twitch_login, "refreshing OAuth grant");
        match self.oauth.refresh(&grant.refresh_token).await {
            Ok(new_grant) => {
                let refresh_token = new_grant
                    .refresh_token
                    .unwrap_or_else(|| grant.refresh_token.clone());
                let expires_at =
                    Utc::now() + Duration::seconds(new_grant.expires_in_secs as i64);

                self.repo
                    .write_refresh(
                        twitch_user_id,
                        &new_grant.access_token,
                        &refresh_token,
                        expires_at,
                    )
                    .await?;
                self.repo.clear_failure(twitch_user_id).await?;

                info!(login = twitch_login, "OAuth grant refreshed");
                Ok(true)
            }
            Err(TokenError::InvalidGrant(message)) => {
                self.handle_invalid_grant(twitch_user_id, twitch_login, &message)
                    .await?;
                Ok(false)
            }
            Err(TokenError::RateLimited) => {
                warn!(login = twitch_login, "identity service rate limited, skipping cycle");
                Ok(false)
            }
            Err(TokenError::TransientRemote(message)) => {
                warn!(login = twitch_login, message, "transient refresh failure");
                Ok(false)
            }
        }
    }

    /// Ledger bookkeeping plus the one-shot notifications for a dead refresh
    /// grant. Both notifications are idempotent through the per-record flags.
    async fn handle_invalid_grant(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        message: &str,
    ) -> CredentialResult<()> {
        let outcome = self
            .repo
            .record_failure(twitch_user_id, twitch_login, message)
            .await?;

        if outcome.disabled_now {
            warn!(
                login = twitch_login,
                count = outcome.error_count,
                "auto-raid disabled after consecutive refresh failures"
            );
        }

        let Some(failure) = self.repo.failure(twitch_user_id).await? else {
            return Ok(());
        };

        if failure.error_count >= self.repo.config().disable_threshold {
            if !failure.admin_notified {
                self.notifier
                    .token_error_admin(twitch_user_id, twitch_login, message)
                    .await;
                self.repo.mark_admin_notified(twitch_user_id).await?;
            }

            if !failure.user_dm_sent {
                let auth_url = self.fresh_auth_url(twitch_login);
                self.notifier
                    .token_error_dm(twitch_user_id, twitch_login, &auth_url)
                    .await;
                self.repo.mark_user_dm_sent(twitch_user_id).await?;
            }
        }

        Ok(())
    }

    /// A freshly generated auth-start link for DMs.
    pub fn fresh_auth_url(&self, twitch_login: &str) -> String {
        let state = self.auth_states.issue(twitch_login);
        self.oauth.authorize_url(&state)
    }
}
