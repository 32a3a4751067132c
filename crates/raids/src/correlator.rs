//! Pending-raid correlator: matches inbound raid-arrival events against
//! outstanding dispatches and fires the post-raid chat message.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use sqlx::SqlitePool;
use streamnet_twitch::RaidEvent;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::chat::{ChatSink, RaidArrivalMessage};
use crate::history::RaidHistoryRepository;
use crate::pending::{log_reaped, PendingRaidBook, EXTERNAL_SUPPRESSION_SECS};
use crate::types::RaidsResult;

/// Cadence of the stale-entry reaper.
const REAPER_INTERVAL: StdDuration = StdDuration::from_secs(120);

pub struct PendingRaidCorrelator {
    pool: SqlitePool,
    book: Arc<PendingRaidBook>,
    history: RaidHistoryRepository,
    chat: Arc<dyn ChatSink>,
}

impl PendingRaidCorrelator {
    pub fn new(pool: SqlitePool, book: Arc<PendingRaidBook>, chat: Arc<dyn ChatSink>) -> Self {
        Self {
            history: RaidHistoryRepository::new(pool.clone()),
            pool,
            book,
            chat,
        }
    }

    /// Process one inbound `channel.raid` event.
    pub async fn on_raid_arrival(&self, event: &RaidEvent) -> RaidsResult<()> {
        let to_id = event.to_broadcaster_user_id.as_str();

        let Some(pending) = self.book.peek(to_id) else {
            // Externally initiated raid: keep the offline auto-raid from
            // double-firing for the human origin.
            let origin_id = match &event.from_broadcaster_user_id {
                Some(id) if !id.is_empty() => Some(id.clone()),
                _ => self.resolve_user_id(&event.from_broadcaster_user_login).await?,
            };

            if let Some(origin_id) = origin_id {
                self.book.mark_suppressed(&origin_id, EXTERNAL_SUPPRESSION_SECS);
                info!(
                    from = %event.from_broadcaster_user_login,
                    to = %event.to_broadcaster_user_login,
                    origin_id,
                    "external raid observed, suppressing next offline auto-raid"
                );
            } else {
                debug!(
                    from = %event.from_broadcaster_user_login,
                    to = %event.to_broadcaster_user_login,
                    "raid arrival ignored, origin unknown and nothing pending"
                );
            }
            return Ok(());
        };

        if !pending
            .from_login
            .eq_ignore_ascii_case(&event.from_broadcaster_user_login)
        {
            warn!(
                expected = %pending.from_login,
                got = %event.from_broadcaster_user_login,
                to = %event.to_broadcaster_user_login,
                "raid arrival origin mismatch, leaving entry for the reaper"
            );
            return Ok(());
        }

        let Some(pending) = self.book.consume_if_from(to_id, &event.from_broadcaster_user_login)
        else {
            return Ok(());
        };

        info!(
            from = %event.from_broadcaster_user_login,
            to = %event.to_broadcaster_user_login,
            viewers = event.viewers,
            partner = pending.partner_raid,
            "raid arrival confirmed"
        );

        if self.is_silent_raid(&event.to_broadcaster_user_login).await? {
            info!(
                to = %event.to_broadcaster_user_login,
                "post-raid message suppressed by target setting"
            );
            return Ok(());
        }

        let network_raid_number = self.history.network_raid_count(to_id).await?.max(1);

        self.chat
            .post_raid_arrival(RaidArrivalMessage {
                to_broadcaster_id: to_id.to_string(),
                to_broadcaster_login: event.to_broadcaster_user_login.clone(),
                from_broadcaster_login: event.from_broadcaster_user_login.clone(),
                viewer_count: event.viewers,
                partner_raid: pending.partner_raid,
                network_raid_number,
            })
            .await;

        Ok(())
    }

    /// Periodic maintenance: reap timed-out pending raids and expired
    /// suppressions. Exits on shutdown.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REAPER_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("pending-raid reaper stopping");
                        return;
                    }
                    continue;
                }
            }

            self.reap_once();
        }
    }

    pub fn reap_once(&self) {
        let reaped = self.book.reap_stale();
        log_reaped(&reaped);
        self.book.reap_expired_suppressions();
    }

    async fn resolve_user_id(&self, login: &str) -> RaidsResult<Option<String>> {
        let id: Option<Option<String>> =
            sqlx::query_scalar("SELECT twitch_user_id FROM streamers WHERE twitch_login = ?")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.flatten().filter(|id| !id.is_empty()))
    }

    async fn is_silent_raid(&self, login: &str) -> RaidsResult<bool> {
        let silent: Option<bool> =
            sqlx::query_scalar("SELECT silent_raid FROM streamers WHERE twitch_login = ?")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;
        Ok(silent.unwrap_or(false))
    }
}
