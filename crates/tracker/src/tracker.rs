//! The live-state tracker.
//!
//! Driven by two input streams: the periodic poll snapshot and explicit
//! online/offline notifications. Owns the `live_state` table and the session
//! lifecycle; publishes offline transitions through the [`OfflineHook`] seam.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use streamnet_twitch::StreamInfo;
use tracing::{debug, info, warn};

use crate::hook::{OfflineHook, OfflineTransition};
use crate::session_repository::SessionRepository;
use crate::types::{TrackerError, TrackerResult};

/// One observation of a live broadcaster, from either input stream.
#[derive(Debug, Clone)]
pub struct LiveObservation {
    pub twitch_user_id: String,
    pub twitch_login: String,
    pub stream_id: Option<String>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub viewer_count: i64,
    pub started_at: DateTime<Utc>,
}

impl LiveObservation {
    pub fn from_stream(stream: &StreamInfo) -> Self {
        Self {
            twitch_user_id: stream.user_id.clone(),
            twitch_login: stream.user_login.clone(),
            stream_id: if stream.id.is_empty() {
                None
            } else {
                Some(stream.id.clone())
            },
            title: Some(stream.title.clone()),
            category: Some(stream.game_name.clone()),
            viewer_count: stream.viewer_count,
            started_at: stream
                .started_at
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

pub struct LiveTracker {
    pool: SqlitePool,
    sessions: SessionRepository,
    hook: Arc<dyn OfflineHook>,
    /// Consecutive snapshots a live broadcaster has been absent from.
    miss_counts: Mutex<HashMap<String, u32>>,
    offline_miss_threshold: u32,
}

impl LiveTracker {
    pub fn new(pool: SqlitePool, hook: Arc<dyn OfflineHook>, offline_miss_threshold: u32) -> Self {
        Self {
            sessions: SessionRepository::new(pool.clone()),
            pool,
            hook,
            miss_counts: Mutex::new(HashMap::new()),
            offline_miss_threshold: offline_miss_threshold.max(1),
        }
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    /// Process one poll snapshot: every stream in it is observed online;
    /// every tracked broadcaster missing from it moves one step toward the
    /// offline transition.
    pub async fn handle_snapshot(&self, streams: &[StreamInfo]) -> TrackerResult<()> {
        let mut seen: HashSet<String> = HashSet::new();

        for stream in streams {
            seen.insert(stream.user_id.clone());
            self.observe_online(&LiveObservation::from_stream(stream)).await?;
        }

        self.miss_counts
            .lock()
            .expect("miss counter lock poisoned")
            .retain(|user_id, _| !seen.contains(user_id));

        let live_rows = sqlx::query(
            "SELECT twitch_user_id, streamer_login, last_viewer_count \
             FROM live_state WHERE is_live = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in live_rows {
            let user_id: String = row.get("twitch_user_id");
            if seen.contains(&user_id) {
                continue;
            }

            let misses = {
                let mut counts = self.miss_counts.lock().expect("miss counter lock poisoned");
                let entry = counts.entry(user_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            if misses >= self.offline_miss_threshold {
                let login: String = row.get("streamer_login");
                debug!(login, misses, "absent from consecutive snapshots, going offline");
                self.transition_offline(&user_id).await?;
            }
        }

        Ok(())
    }

    /// An explicit online notification.
    pub async fn handle_online(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> TrackerResult<()> {
        self.observe_online(&LiveObservation {
            twitch_user_id: twitch_user_id.to_string(),
            twitch_login: twitch_login.to_string(),
            stream_id: None,
            title: None,
            category: None,
            viewer_count: 0,
            started_at: started_at.unwrap_or_else(Utc::now),
        })
        .await
    }

    /// An explicit offline notification closes immediately, bypassing the
    /// miss counter.
    pub async fn handle_offline(&self, twitch_user_id: &str) -> TrackerResult<()> {
        self.transition_offline(twitch_user_id).await
    }

    async fn observe_online(&self, observation: &LiveObservation) -> TrackerResult<()> {
        let now = Utc::now();

        let state = sqlx::query(
            "SELECT is_live, active_session_id FROM live_state WHERE twitch_user_id = ?",
        )
        .bind(&observation.twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        let active_session: Option<i64> = match &state {
            Some(row) if row.get::<bool, _>("is_live") => row.get("active_session_id"),
            _ => None,
        };

        self.miss_counts
            .lock()
            .expect("miss counter lock poisoned")
            .remove(&observation.twitch_user_id);

        match active_session {
            Some(session_id) => {
                // Online → online: sample, refresh metadata, track the peak.
                self.sessions
                    .append_sample(session_id, now, observation.viewer_count)
                    .await?;

                sqlx::query(
                    "UPDATE live_state SET \
                        last_seen_at = ?, last_viewer_count = ?, \
                        last_title = COALESCE(?, last_title), \
                        last_category = COALESCE(?, last_category) \
                     WHERE twitch_user_id = ?",
                )
                .bind(now.to_rfc3339())
                .bind(observation.viewer_count)
                .bind(&observation.title)
                .bind(&observation.category)
                .bind(&observation.twitch_user_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                // Offline → online: open the session before any other write
                // references it.
                let session_id = self
                    .sessions
                    .open_session(
                        &observation.twitch_login,
                        observation.stream_id.as_deref(),
                        observation.started_at,
                        observation.viewer_count,
                    )
                    .await?;

                sqlx::query(
                    "INSERT INTO live_state \
                     (twitch_user_id, streamer_login, is_live, active_session_id, \
                      last_started_at, last_seen_at, last_title, last_category, \
                      last_viewer_count) \
                     VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(twitch_user_id) DO UPDATE SET \
                      streamer_login = excluded.streamer_login, \
                      is_live = 1, \
                      active_session_id = excluded.active_session_id, \
                      last_started_at = excluded.last_started_at, \
                      last_seen_at = excluded.last_seen_at, \
                      last_title = COALESCE(excluded.last_title, live_state.last_title), \
                      last_category = COALESCE(excluded.last_category, live_state.last_category), \
                      last_viewer_count = excluded.last_viewer_count",
                )
                .bind(&observation.twitch_user_id)
                .bind(&observation.twitch_login)
                .bind(session_id)
                .bind(observation.started_at.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(&observation.title)
                .bind(&observation.category)
                .bind(observation.viewer_count)
                .execute(&self.pool)
                .await?;

                info!(
                    login = %observation.twitch_login,
                    session_id,
                    viewers = observation.viewer_count,
                    "broadcaster went online"
                );
            }
        }

        Ok(())
    }

    /// Close the active session and flip the live flag. Idempotent: a second
    /// call finds no open session and does nothing.
    async fn transition_offline(&self, twitch_user_id: &str) -> TrackerResult<()> {
        let row = sqlx::query(
            "SELECT streamer_login, active_session_id, last_viewer_count \
             FROM live_state WHERE twitch_user_id = ? AND is_live = 1",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            debug!(user_id = twitch_user_id, "offline for already-offline broadcaster");
            return Ok(());
        };

        let login: String = row.get("streamer_login");
        let session_id: Option<i64> = row.get("active_session_id");
        let last_viewer_count: i64 = row.get("last_viewer_count");

        let mut duration_secs = 0i64;
        if let Some(session_id) = session_id {
            self.sessions.close_session(session_id).await?;
            if let Some(session) = self.sessions.find(session_id).await? {
                duration_secs = session.duration_seconds;
            }
        } else {
            warn!(login, "live row without active session id");
        }

        // The session close above is the last write to its row; the state
        // flip is what makes invariant `is_live ⇔ open session` hold.
        sqlx::query(
            "UPDATE live_state SET is_live = 0, active_session_id = NULL, last_seen_at = ? \
             WHERE twitch_user_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(twitch_user_id)
        .execute(&self.pool)
        .await?;

        self.miss_counts
            .lock()
            .expect("miss counter lock poisoned")
            .remove(twitch_user_id);

        info!(login, viewers = last_viewer_count, duration_secs, "broadcaster went offline");

        self.hook
            .on_offline(OfflineTransition {
                twitch_user_id: twitch_user_id.to_string(),
                twitch_login: login,
                viewer_count: last_viewer_count,
                stream_duration_secs: duration_secs,
            })
            .await;

        Ok(())
    }

    /// Adopt sessions left open by a previous process: resume the ones whose
    /// broadcaster is still live, close the rest.
    pub async fn rehydrate(&self, currently_live: &[StreamInfo]) -> TrackerResult<()> {
        let live_logins: HashSet<String> = currently_live
            .iter()
            .map(|s| s.user_login.to_lowercase())
            .collect();

        for (session_id, login) in self.sessions.open_sessions().await? {
            if live_logins.contains(&login.to_lowercase()) {
                info!(login, session_id, "resuming open session after restart");
                continue;
            }

            info!(login, session_id, "closing stale session after restart");
            self.sessions.close_session(session_id).await?;

            sqlx::query(
                "UPDATE live_state SET is_live = 0, active_session_id = NULL \
                 WHERE active_session_id = ?",
            )
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Active session id for a broadcaster login, if one is open.
    pub async fn active_session_id(&self, twitch_login: &str) -> TrackerResult<Option<i64>> {
        let id: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT active_session_id FROM live_state \
             WHERE streamer_login = ? AND is_live = 1",
        )
        .bind(twitch_login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.flatten())
    }

    /// Record a chat message against the broadcaster's open session.
    pub async fn record_chat_message(
        &self,
        twitch_login: &str,
        chatter_login: &str,
    ) -> TrackerResult<()> {
        match self.active_session_id(twitch_login).await? {
            Some(session_id) => {
                self.sessions
                    .record_chat_message(session_id, twitch_login, chatter_login)
                    .await
            }
            None => Err(TrackerError::NoOpenSession(twitch_login.to_string())),
        }
    }
}
