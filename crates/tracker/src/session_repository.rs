//! Stream session persistence: open, sample, close, and the close-time
//! metric computation.
//!
//! Ordering contract: the session row exists before any sample insert, and
//! the close is the last write to the row. The close uses an update-if-open
//! predicate so two concurrent close attempts converge to one write.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::types::{TrackerError, TrackerResult};

/// Drop-off bucket boundaries, in percent of peak.
const DROPOFF_LOW_MAX: f64 = 10.0;
const DROPOFF_MODERATE_MAX: f64 = 30.0;

fn dropoff_label(pct: f64) -> &'static str {
    if pct < DROPOFF_LOW_MAX {
        "<10%"
    } else if pct <= DROPOFF_MODERATE_MAX {
        "10-30%"
    } else {
        ">30%"
    }
}

fn parse_ts(raw: &str, column: &str) -> TrackerResult<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|_| TrackerError::InvalidTimestamp(column.to_string()))
}

/// A session row as read back for reporting and tests.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: i64,
    pub streamer_login: String,
    pub stream_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub start_viewers: i64,
    pub peak_viewers: i64,
    pub end_viewers: i64,
    pub avg_viewers: f64,
    pub samples: i64,
    pub metrics: SessionMetrics,
    pub unique_chatters: i64,
    pub first_time_chatters: i64,
    pub returning_chatters: i64,
    pub follower_delta: Option<i64>,
}

/// Retention and drop-off numbers computed at close time.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub retention_5m: Option<f64>,
    pub retention_10m: Option<f64>,
    pub retention_20m: Option<f64>,
    pub dropoff_pct: Option<f64>,
    pub dropoff_label: Option<String>,
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a new session and record the start viewer count as its first
    /// sample. Returns the session id.
    pub async fn open_session(
        &self,
        streamer_login: &str,
        stream_id: Option<&str>,
        started_at: DateTime<Utc>,
        start_viewers: i64,
    ) -> TrackerResult<i64> {
        let result = sqlx::query(
            "INSERT INTO stream_sessions \
             (streamer_login, stream_id, started_at, start_viewers, peak_viewers) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(streamer_login)
        .bind(stream_id)
        .bind(started_at.to_rfc3339())
        .bind(start_viewers)
        .bind(start_viewers)
        .execute(&self.pool)
        .await?;

        let session_id = result.last_insert_rowid();

        // The start viewer count is the t=0 observation; retention is
        // computed relative to it.
        self.append_sample(session_id, started_at, start_viewers).await?;

        info!(login = streamer_login, session_id, start_viewers, "opened stream session");
        Ok(session_id)
    }

    /// Append one viewer-count sample. Duplicate `(session, timestamp)` pairs
    /// are dropped by the composite key. Keeps the stored peak current.
    pub async fn append_sample(
        &self,
        session_id: i64,
        ts: DateTime<Utc>,
        viewer_count: i64,
    ) -> TrackerResult<()> {
        let started_raw: Option<String> =
            sqlx::query_scalar("SELECT started_at FROM stream_sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(started_raw) = started_raw else {
            return Err(TrackerError::NoOpenSession(format!("session {session_id}")));
        };
        let started_at = parse_ts(&started_raw, "started_at")?;
        let minutes_from_start = (ts - started_at).num_minutes().max(0);

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO session_samples \
             (session_id, ts_utc, minutes_from_start, viewer_count) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(ts.to_rfc3339())
        .bind(minutes_from_start)
        .bind(viewer_count)
        .execute(&self.pool)
        .await?;

        // A dropped duplicate tick must not move the peak either.
        if inserted.rows_affected() > 0 {
            sqlx::query(
                "UPDATE stream_sessions SET peak_viewers = MAX(peak_viewers, ?) WHERE id = ?",
            )
            .bind(viewer_count)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Close a session and finalize its metrics. Idempotent: a second close
    /// observes `ended_at` already set and returns `false` without mutation.
    pub async fn close_session(&self, session_id: i64) -> TrackerResult<bool> {
        let row = sqlx::query(
            "SELECT streamer_login, started_at, start_viewers, peak_viewers \
             FROM stream_sessions WHERE id = ? AND ended_at IS NULL",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            debug!(session_id, "close skipped, session already ended");
            return Ok(false);
        };

        let login: String = row.get("streamer_login");
        let started_at = parse_ts(&row.get::<String, _>("started_at"), "started_at")?;
        let start_viewers: i64 = row.get("start_viewers");
        let peak_viewers: i64 = row.get("peak_viewers");

        let ended_at = Utc::now();
        let duration_seconds = (ended_at - started_at).num_seconds().max(0);

        let stats = sqlx::query(
            "SELECT COUNT(*) AS samples, COALESCE(AVG(viewer_count), 0) AS avg_viewers \
             FROM session_samples WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        let samples: i64 = stats.get("samples");
        let avg_viewers: f64 = stats.get("avg_viewers");

        let end_viewers: i64 = sqlx::query_scalar(
            "SELECT viewer_count FROM session_samples \
             WHERE session_id = ? ORDER BY ts_utc DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        let retention_5m = self.retention_at(session_id, 5, start_viewers).await?;
        let retention_10m = self.retention_at(session_id, 10, start_viewers).await?;
        let retention_20m = self.retention_at(session_id, 20, start_viewers).await?;

        let (dropoff_pct, label) = if peak_viewers > 0 {
            let pct = (peak_viewers - end_viewers) as f64 / peak_viewers as f64 * 100.0;
            (Some(pct), Some(dropoff_label(pct)))
        } else {
            (None, None)
        };

        let chatters = sqlx::query(
            "SELECT COUNT(*) AS unique_chatters, \
                    COALESCE(SUM(is_first_time_global), 0) AS first_time \
             FROM session_chatters WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        let unique_chatters: i64 = chatters.get("unique_chatters");
        let first_time_chatters: i64 = chatters.get("first_time");

        let result = sqlx::query(
            "UPDATE stream_sessions SET \
                ended_at = ?, duration_seconds = ?, end_viewers = ?, avg_viewers = ?, \
                samples = ?, retention_5m = ?, retention_10m = ?, retention_20m = ?, \
                dropoff_pct = ?, dropoff_label = ?, unique_chatters = ?, \
                first_time_chatters = ?, returning_chatters = ? \
             WHERE id = ? AND ended_at IS NULL",
        )
        .bind(ended_at.to_rfc3339())
        .bind(duration_seconds)
        .bind(end_viewers)
        .bind(avg_viewers)
        .bind(samples)
        .bind(retention_5m)
        .bind(retention_10m)
        .bind(retention_20m)
        .bind(dropoff_pct)
        .bind(label)
        .bind(unique_chatters)
        .bind(first_time_chatters)
        .bind(unique_chatters - first_time_chatters)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        let closed = result.rows_affected() > 0;
        if closed {
            info!(
                login,
                session_id,
                duration_seconds,
                peak_viewers,
                end_viewers,
                "closed stream session"
            );
        }
        Ok(closed)
    }

    /// Viewer retention N minutes in, relative to the start viewer count.
    /// `None` when the session has fewer than N minutes of samples or the
    /// stream started with nobody watching.
    async fn retention_at(
        &self,
        session_id: i64,
        minutes: i64,
        start_viewers: i64,
    ) -> TrackerResult<Option<f64>> {
        if start_viewers <= 0 {
            return Ok(None);
        }

        let viewer_count: Option<i64> = sqlx::query_scalar(
            "SELECT viewer_count FROM session_samples \
             WHERE session_id = ? AND minutes_from_start >= ? \
             ORDER BY minutes_from_start ASC LIMIT 1",
        )
        .bind(session_id)
        .bind(minutes)
        .fetch_optional(&self.pool)
        .await?;

        Ok(viewer_count.map(|v| v as f64 / start_viewers as f64 * 100.0))
    }

    pub async fn find(&self, session_id: i64) -> TrackerResult<Option<StreamSession>> {
        let row = sqlx::query(
            "SELECT id, streamer_login, stream_id, started_at, ended_at, duration_seconds, \
                    start_viewers, peak_viewers, end_viewers, avg_viewers, samples, \
                    retention_5m, retention_10m, retention_20m, dropoff_pct, dropoff_label, \
                    unique_chatters, first_time_chatters, returning_chatters, follower_delta \
             FROM stream_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StreamSession {
            id: row.get("id"),
            streamer_login: row.get("streamer_login"),
            stream_id: row.get("stream_id"),
            started_at: parse_ts(&row.get::<String, _>("started_at"), "started_at")?,
            ended_at: row
                .get::<Option<String>, _>("ended_at")
                .map(|s| parse_ts(&s, "ended_at"))
                .transpose()?,
            duration_seconds: row.get("duration_seconds"),
            start_viewers: row.get("start_viewers"),
            peak_viewers: row.get("peak_viewers"),
            end_viewers: row.get("end_viewers"),
            avg_viewers: row.get("avg_viewers"),
            samples: row.get("samples"),
            metrics: SessionMetrics {
                retention_5m: row.get("retention_5m"),
                retention_10m: row.get("retention_10m"),
                retention_20m: row.get("retention_20m"),
                dropoff_pct: row.get("dropoff_pct"),
                dropoff_label: row.get("dropoff_label"),
            },
            unique_chatters: row.get("unique_chatters"),
            first_time_chatters: row.get("first_time_chatters"),
            returning_chatters: row.get("returning_chatters"),
            follower_delta: row.get("follower_delta"),
        }))
    }

    /// Sessions never closed, e.g. because the process died mid-stream.
    pub async fn open_sessions(&self) -> TrackerResult<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT id, streamer_login FROM stream_sessions WHERE ended_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("streamer_login")))
            .collect())
    }

    /// Late-arriving follower delta for an already-closed session.
    pub async fn set_follower_delta(&self, session_id: i64, delta: i64) -> TrackerResult<()> {
        sqlx::query("UPDATE stream_sessions SET follower_delta = ? WHERE id = ?")
            .bind(delta)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a chat message inside an open session. First message of a
    /// chatter in this session creates the row; the global-first flag is set
    /// when the chatter was never seen in any earlier session of this
    /// broadcaster.
    pub async fn record_chat_message(
        &self,
        session_id: i64,
        streamer_login: &str,
        chatter_login: &str,
    ) -> TrackerResult<()> {
        let now = Utc::now().to_rfc3339();

        let seen_before: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM session_chatters \
             WHERE streamer_login = ? AND chatter_login = ? AND session_id != ?",
        )
        .bind(streamer_login)
        .bind(chatter_login)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO session_chatters \
             (session_id, streamer_login, chatter_login, first_seen_at, last_seen_at, \
              messages, is_first_time_global) \
             VALUES (?, ?, ?, ?, ?, 1, ?) \
             ON CONFLICT(session_id, chatter_login) DO UPDATE SET \
              messages = session_chatters.messages + 1, \
              last_seen_at = excluded.last_seen_at",
        )
        .bind(session_id)
        .bind(streamer_login)
        .bind(chatter_login)
        .bind(&now)
        .bind(&now)
        .bind(seen_before == 0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Refresh `last_seen_at` for chatters reported by a membership poll.
    pub async fn touch_chatters(
        &self,
        session_id: i64,
        chatter_logins: &[String],
    ) -> TrackerResult<()> {
        let now = Utc::now().to_rfc3339();
        for chatter in chatter_logins {
            sqlx::query(
                "UPDATE session_chatters SET last_seen_at = ? \
                 WHERE session_id = ? AND chatter_login = ?",
            )
            .bind(&now)
            .bind(session_id)
            .bind(chatter)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
