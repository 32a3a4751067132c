//! Grace-period controller.
//!
//! Auto-raid is disabled the moment the failure threshold is reached; the
//! partnership role survives for the grace period so a transient lapse never
//! costs a broadcaster their role. Once the grace clock runs out this
//! controller sends the reminder pair and schedules the role removal.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use sqlx::SqlitePool;
use streamnet_twitch::{AuthStateStore, TwitchOAuth};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::notify::{PartnerNotifier, RoleSync};
use crate::repository::CredentialRepository;
use crate::types::CredentialResult;

const GRACE_CYCLE: StdDuration = StdDuration::from_secs(60 * 60);

pub struct GraceController {
    repo: CredentialRepository,
    pool: SqlitePool,
    oauth: Arc<TwitchOAuth>,
    auth_states: Arc<AuthStateStore>,
    notifier: Arc<dyn PartnerNotifier>,
    role_sync: Arc<dyn RoleSync>,
}

impl GraceController {
    pub fn new(
        repo: CredentialRepository,
        pool: SqlitePool,
        oauth: Arc<TwitchOAuth>,
        auth_states: Arc<AuthStateStore>,
        notifier: Arc<dyn PartnerNotifier>,
        role_sync: Arc<dyn RoleSync>,
    ) -> Self {
        Self {
            repo,
            pool,
            oauth,
            auth_states,
            notifier,
            role_sync,
        }
    }

    /// Hourly loop; exits after the current iteration on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(GRACE_CYCLE) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("grace controller stopping");
                        return;
                    }
                    continue;
                }
            }

            if let Err(err) = self.run_once().await {
                error!(?err, "grace-period pass failed");
            }
        }
    }

    /// One pass over all expired grace periods.
    pub async fn run_once(&self) -> CredentialResult<usize> {
        let expired = self.repo.expired_grace_failures().await?;
        let mut processed = 0usize;

        for failure in expired {
            let discord_user_id = self.discord_user_id(&failure.twitch_user_id).await?;

            if !failure.reminder_sent {
                let state = self.auth_states.issue(&failure.twitch_login);
                let auth_url = self.oauth.authorize_url(&state);

                self.notifier
                    .grace_reminder_dm(&failure.twitch_user_id, &failure.twitch_login, &auth_url)
                    .await;
                self.notifier
                    .grace_expired_admin(
                        &failure.twitch_user_id,
                        &failure.twitch_login,
                        discord_user_id.as_deref(),
                    )
                    .await;
                self.repo.mark_reminder_sent(&failure.twitch_user_id).await?;
            }

            if let Some(discord_user_id) = discord_user_id {
                self.role_sync
                    .remove_partner_role(
                        &discord_user_id,
                        "partnership grace period expired without re-authorization",
                    )
                    .await;
            } else {
                debug!(
                    login = %failure.twitch_login,
                    "no linked discord account, skipping role removal"
                );
            }

            self.repo.mark_role_removed(&failure.twitch_user_id).await?;
            processed += 1;

            info!(
                login = %failure.twitch_login,
                user_id = %failure.twitch_user_id,
                "grace period expired, reminder sent and role removal scheduled"
            );
        }

        Ok(processed)
    }

    async fn discord_user_id(&self, twitch_user_id: &str) -> CredentialResult<Option<String>> {
        let id: Option<Option<String>> = sqlx::query_scalar(
            "SELECT discord_user_id FROM streamers WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.flatten().filter(|id| !id.is_empty()))
    }
}
