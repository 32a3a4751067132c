//! Raid dispatcher: picks a target when a partnered broadcaster goes offline
//! and drives the platform's raid endpoint.
//!
//! Selection is supportive by design: the smallest live streamer wins, with
//! follower total and stream start time as tie-breaks, and targets raided
//! within the cooldown window are avoided while alternatives remain.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use streamnet_config::{PartnershipConfig, TwitchConfig};
use streamnet_credentials::TokenRefresher;
use streamnet_tracker::{OfflineHook, OfflineTransition};
use streamnet_twitch::{HelixClient, RaidError, StreamInfo};
use tracing::{debug, error, info, warn};

use crate::history::{RaidAttempt, RaidHistoryRepository};
use crate::pending::{PendingRaid, PendingRaidBook, MANUAL_SUPPRESSION_SECS};
use crate::types::RaidsResult;

const MAX_ATTEMPTS: usize = 3;
const TIER2_FETCH_LIMIT: usize = 50;

pub const REASON_AUTO_OFFLINE: &str = "auto_raid_on_offline";
pub const REASON_MANUAL_COMMAND: &str = "manual_chat_command";

/// How a dispatch trigger ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Raided { target_login: String },
    /// A manual raid was observed recently; the auto-raid stands down.
    Suppressed,
    /// Auto-raid not enabled for the origin, or no enabled grant.
    NotEligible,
    NoCandidates,
    /// No usable token for the origin (blacklisted, cooldown, or missing).
    NoToken,
    /// Non-retryable raid API failure; the trigger was abandoned.
    Aborted { error: String },
}

#[derive(Debug, Clone)]
struct Candidate {
    user_id: String,
    login: String,
    viewer_count: i64,
    followers_total: Option<i64>,
    started_at: String,
    partner: bool,
}

impl Candidate {
    fn from_stream(stream: &StreamInfo) -> Self {
        Self {
            user_id: stream.user_id.clone(),
            login: stream.user_login.clone(),
            viewer_count: stream.viewer_count,
            followers_total: None,
            started_at: stream.started_at.clone(),
            partner: false,
        }
    }
}

pub struct RaidDispatcher {
    pool: SqlitePool,
    history: RaidHistoryRepository,
    book: Arc<PendingRaidBook>,
    refresher: Arc<TokenRefresher>,
    helix: Arc<HelixClient>,
    partnership: PartnershipConfig,
    twitch: TwitchConfig,
}

impl RaidDispatcher {
    pub fn new(
        pool: SqlitePool,
        book: Arc<PendingRaidBook>,
        refresher: Arc<TokenRefresher>,
        helix: Arc<HelixClient>,
        partnership: PartnershipConfig,
        twitch: TwitchConfig,
    ) -> Self {
        Self {
            history: RaidHistoryRepository::new(pool.clone()),
            pool,
            book,
            refresher,
            helix,
            partnership,
            twitch,
        }
    }

    pub fn history(&self) -> &RaidHistoryRepository {
        &self.history
    }

    /// Auto-raid on an offline transition.
    pub async fn dispatch_on_offline(
        &self,
        origin_id: &str,
        origin_login: &str,
        viewer_count: i64,
        stream_duration_secs: i64,
    ) -> RaidsResult<DispatchOutcome> {
        if self.book.is_suppressed(origin_id) {
            info!(login = origin_login, "auto-raid suppressed, manual raid seen recently");
            return Ok(DispatchOutcome::Suppressed);
        }

        self.dispatch(
            origin_id,
            origin_login,
            viewer_count,
            stream_duration_secs,
            REASON_AUTO_OFFLINE,
        )
        .await
    }

    /// Manual invocation from the chat-bot collaborator. Marks the origin as
    /// suppressed so the following offline transition does not double-fire.
    pub async fn dispatch_manual(
        &self,
        origin_id: &str,
        origin_login: &str,
        viewer_count: i64,
        stream_duration_secs: i64,
    ) -> RaidsResult<DispatchOutcome> {
        self.book.mark_suppressed(origin_id, MANUAL_SUPPRESSION_SECS);

        self.dispatch(
            origin_id,
            origin_login,
            viewer_count,
            stream_duration_secs,
            REASON_MANUAL_COMMAND,
        )
        .await
    }

    async fn dispatch(
        &self,
        origin_id: &str,
        origin_login: &str,
        viewer_count: i64,
        stream_duration_secs: i64,
        reason: &str,
    ) -> RaidsResult<DispatchOutcome> {
        if !self.is_eligible(origin_id).await? {
            debug!(login = origin_login, "auto-raid not enabled for origin");
            return Ok(DispatchOutcome::NotEligible);
        }

        let mut exclude: HashSet<String> = HashSet::new();
        exclude.insert(origin_id.to_string());
        let mut tier2_cache: Option<Vec<StreamInfo>> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let (candidates, partner_tier) =
                self.collect_candidates(&exclude, &mut tier2_cache, origin_login).await?;

            if candidates.is_empty() {
                info!(
                    login = origin_login,
                    attempt,
                    "no valid raid target found"
                );
                return Ok(DispatchOutcome::NoCandidates);
            }

            let candidates_count = candidates.len() as i64;
            let Some(target) = self.select_fairest(candidates, origin_id).await? else {
                return Ok(DispatchOutcome::NoCandidates);
            };

            info!(
                attempt,
                from = origin_login,
                to = %target.login,
                partner = partner_tier,
                "executing raid attempt"
            );

            let token = match self.refresher.get_valid_token(origin_id).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    let message = format!("no valid token for {origin_login}");
                    warn!(login = origin_login, "raid abandoned, no usable token");
                    self.record_attempt(
                        origin_id,
                        origin_login,
                        &target,
                        viewer_count,
                        stream_duration_secs,
                        candidates_count,
                        reason,
                        false,
                        Some(&message),
                    )
                    .await?;
                    return Ok(DispatchOutcome::NoToken);
                }
                Err(err) => {
                    let message = err.to_string();
                    error!(login = origin_login, error = %message, "token lookup failed");
                    self.record_attempt(
                        origin_id,
                        origin_login,
                        &target,
                        viewer_count,
                        stream_duration_secs,
                        candidates_count,
                        reason,
                        false,
                        Some(&message),
                    )
                    .await?;
                    return Ok(DispatchOutcome::Aborted { error: message });
                }
            };

            match self
                .helix
                .start_raid(origin_id, &target.user_id, &token)
                .await
            {
                Ok(()) => {
                    info!(
                        from = origin_login,
                        to = %target.login,
                        viewers = viewer_count,
                        candidates = candidates_count,
                        "raid successful"
                    );
                    self.record_attempt(
                        origin_id,
                        origin_login,
                        &target,
                        viewer_count,
                        stream_duration_secs,
                        candidates_count,
                        reason,
                        true,
                        None,
                    )
                    .await?;

                    self.book.register(
                        &target.user_id,
                        PendingRaid {
                            from_login: origin_login.to_string(),
                            to_login: target.login.clone(),
                            target_started_at: Some(target.started_at.clone()),
                            created_at: chrono::Utc::now(),
                            partner_raid: target.partner,
                            viewer_count,
                        },
                    );

                    return Ok(DispatchOutcome::Raided {
                        target_login: target.login,
                    });
                }
                Err(RaidError::TargetRefused(message)) => {
                    self.record_attempt(
                        origin_id,
                        origin_login,
                        &target,
                        viewer_count,
                        stream_duration_secs,
                        candidates_count,
                        reason,
                        false,
                        Some(&message),
                    )
                    .await?;

                    exclude.insert(target.user_id.clone());

                    if target.partner {
                        // Opt-out is a partner setting handled elsewhere;
                        // partners are never blacklisted.
                        warn!(
                            target = %target.login,
                            "partner target does not allow raids, trying next candidate"
                        );
                    } else {
                        warn!(
                            target = %target.login,
                            "target does not allow raids, blacklisting and retrying"
                        );
                        self.history
                            .add_to_blacklist(&target.user_id, &target.login, &message)
                            .await?;
                    }
                }
                Err(RaidError::ApiFatal(message)) => {
                    error!(
                        from = origin_login,
                        to = %target.login,
                        error = %message,
                        "raid failed with non-retryable error"
                    );
                    self.record_attempt(
                        origin_id,
                        origin_login,
                        &target,
                        viewer_count,
                        stream_duration_secs,
                        candidates_count,
                        reason,
                        false,
                        Some(&message),
                    )
                    .await?;
                    return Ok(DispatchOutcome::Aborted { error: message });
                }
            }
        }

        Ok(DispatchOutcome::NoCandidates)
    }

    async fn is_eligible(&self, origin_id: &str) -> RaidsResult<bool> {
        let row = sqlx::query(
            "SELECT s.auto_raid_enabled, g.raid_enabled \
             FROM streamers s \
             LEFT JOIN credential_grants g ON g.twitch_user_id = s.twitch_user_id \
             WHERE s.twitch_user_id = ?",
        )
        .bind(origin_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let auto_raid: bool = row.get("auto_raid_enabled");
        let grant_enabled: Option<bool> = row.get("raid_enabled");
        Ok(auto_raid && grant_enabled.unwrap_or(false))
    }

    /// Tier-1: live partnered broadcasters with an enabled grant. Tier-2
    /// fallback: other live streams in the tracked category and language.
    async fn collect_candidates(
        &self,
        exclude: &HashSet<String>,
        tier2_cache: &mut Option<Vec<StreamInfo>>,
        origin_login: &str,
    ) -> RaidsResult<(Vec<Candidate>, bool)> {
        let rows = sqlx::query(
            "SELECT ls.twitch_user_id AS user_id, ls.streamer_login AS login, \
                    ls.last_viewer_count AS viewer_count, ls.last_started_at AS started_at \
             FROM live_state ls \
             JOIN streamers s ON s.twitch_user_id = ls.twitch_user_id \
             JOIN credential_grants g ON g.twitch_user_id = ls.twitch_user_id \
             WHERE ls.is_live = 1 \
               AND s.opt_out = 0 \
               AND (s.verified_permanent = 1 \
                    OR (s.verified_until IS NOT NULL AND s.verified_until > ?)) \
               AND g.raid_enabled = 1",
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut partners = Vec::new();
        for row in rows {
            let user_id: String = row.get("user_id");
            let login: String = row.get("login");
            if exclude.contains(&user_id) {
                continue;
            }
            if self.history.is_blacklisted(&user_id, &login).await? {
                continue;
            }
            partners.push(Candidate {
                user_id,
                login,
                viewer_count: row.get("viewer_count"),
                followers_total: None,
                started_at: row
                    .get::<Option<String>, _>("started_at")
                    .unwrap_or_default(),
                partner: true,
            });
        }

        if !partners.is_empty() {
            return Ok((partners, true));
        }

        let Some(category_id) = self.twitch.tracked_category_id.as_deref() else {
            return Ok((Vec::new(), false));
        };

        if tier2_cache.is_none() {
            info!(
                login = origin_login,
                "no partners online, fetching category fallback candidates"
            );
            let streams = match self
                .helix
                .streams_by_category(category_id, Some(&self.twitch.language), TIER2_FETCH_LIMIT)
                .await
            {
                Ok(streams) => streams,
                Err(err) => {
                    warn!(?err, "category fallback fetch failed");
                    Vec::new()
                }
            };
            *tier2_cache = Some(streams);
        }

        let mut fallback = Vec::new();
        for stream in tier2_cache.as_deref().unwrap_or_default() {
            if exclude.contains(&stream.user_id) {
                continue;
            }
            if self
                .history
                .is_blacklisted(&stream.user_id, &stream.user_login)
                .await?
            {
                continue;
            }
            fallback.push(Candidate::from_stream(stream));
        }

        Ok((fallback, false))
    }

    /// Pick the candidate with the fewest viewers; follower total and stream
    /// start time break ties. Recent targets are avoided while alternatives
    /// remain.
    async fn select_fairest(
        &self,
        candidates: Vec<Candidate>,
        origin_id: &str,
    ) -> RaidsResult<Option<Candidate>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let recent: HashSet<String> = self
            .history
            .recent_targets(origin_id, self.partnership.raid_target_cooldown_days)
            .await?
            .into_iter()
            .collect();

        let total = candidates.len();
        let mut pool: Vec<Candidate> = if recent.is_empty() {
            candidates
        } else {
            let filtered: Vec<Candidate> = candidates
                .iter()
                .filter(|c| !recent.contains(&c.user_id))
                .cloned()
                .collect();
            if filtered.is_empty() {
                candidates
            } else {
                filtered
            }
        };

        self.attach_followers(&mut pool).await;

        pool.sort_by(|a, b| {
            let key = |c: &Candidate| {
                (
                    c.viewer_count,
                    c.followers_total.unwrap_or(i64::MAX),
                    if c.started_at.is_empty() {
                        "9999".to_string()
                    } else {
                        c.started_at.clone()
                    },
                )
            };
            key(a).cmp(&key(b))
        });

        let selected = pool.into_iter().next();
        if let Some(ref candidate) = selected {
            info!(
                target = %candidate.login,
                viewers = candidate.viewer_count,
                followers = ?candidate.followers_total,
                pool = total,
                "raid target selected"
            );
        }

        Ok(selected)
    }

    /// Best-effort follower totals for tie-breaking. Uses each candidate's
    /// own token (follower reads need their authorization); absent totals
    /// simply sort last.
    async fn attach_followers(&self, pool: &mut [Candidate]) {
        for candidate in pool.iter_mut() {
            if candidate.followers_total.is_some() {
                continue;
            }
            let token = match self.refresher.get_valid_token(&candidate.user_id).await {
                Ok(Some(token)) => token,
                _ => continue,
            };
            candidate.followers_total =
                self.helix.followers_total(&candidate.user_id, &token).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        origin_id: &str,
        origin_login: &str,
        target: &Candidate,
        viewer_count: i64,
        stream_duration_secs: i64,
        candidates_count: i64,
        reason: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> RaidsResult<()> {
        self.history
            .record(&RaidAttempt {
                from_broadcaster_id: origin_id.to_string(),
                from_broadcaster_login: origin_login.to_string(),
                to_broadcaster_id: target.user_id.clone(),
                to_broadcaster_login: target.login.clone(),
                viewer_count,
                stream_duration_sec: Some(stream_duration_secs),
                target_stream_started_at: if target.started_at.is_empty() {
                    None
                } else {
                    Some(target.started_at.clone())
                },
                candidates_count,
                reason: reason.to_string(),
                success,
                error_message: error_message.map(|m| m.to_string()),
            })
            .await
    }
}

#[async_trait]
impl OfflineHook for RaidDispatcher {
    async fn on_offline(&self, transition: OfflineTransition) {
        match self
            .dispatch_on_offline(
                &transition.twitch_user_id,
                &transition.twitch_login,
                transition.viewer_count,
                transition.stream_duration_secs,
            )
            .await
        {
            Ok(outcome) => debug!(login = %transition.twitch_login, ?outcome, "offline dispatch done"),
            Err(err) => error!(login = %transition.twitch_login, ?err, "offline dispatch failed"),
        }
    }
}
