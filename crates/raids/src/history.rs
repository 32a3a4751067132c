//! Raid history and target blacklist persistence.
//!
//! History rows are append-only: a retried attempt produces an additional
//! row, never a mutation.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::types::RaidsResult;

/// One raid attempt, successful or not.
#[derive(Debug, Clone)]
pub struct RaidAttempt {
    pub from_broadcaster_id: String,
    pub from_broadcaster_login: String,
    pub to_broadcaster_id: String,
    pub to_broadcaster_login: String,
    pub viewer_count: i64,
    pub stream_duration_sec: Option<i64>,
    pub target_stream_started_at: Option<String>,
    pub candidates_count: i64,
    pub reason: String,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct RaidHistoryRepository {
    pool: SqlitePool,
}

impl RaidHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, attempt: &RaidAttempt) -> RaidsResult<()> {
        sqlx::query(
            "INSERT INTO raid_history \
             (from_broadcaster_id, from_broadcaster_login, to_broadcaster_id, \
              to_broadcaster_login, viewer_count, stream_duration_sec, reason, \
              executed_at, success, error_message, target_stream_started_at, \
              candidates_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.from_broadcaster_id)
        .bind(&attempt.from_broadcaster_login)
        .bind(&attempt.to_broadcaster_id)
        .bind(&attempt.to_broadcaster_login)
        .bind(attempt.viewer_count)
        .bind(attempt.stream_duration_sec)
        .bind(&attempt.reason)
        .bind(Utc::now().to_rfc3339())
        .bind(attempt.success)
        .bind(&attempt.error_message)
        .bind(&attempt.target_stream_started_at)
        .bind(attempt.candidates_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Targets this origin successfully raided within the last `days`.
    pub async fn recent_targets(
        &self,
        from_broadcaster_id: &str,
        days: u64,
    ) -> RaidsResult<Vec<String>> {
        if days == 0 {
            return Ok(Vec::new());
        }

        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let targets = sqlx::query_scalar(
            "SELECT DISTINCT to_broadcaster_id FROM raid_history \
             WHERE from_broadcaster_id = ? AND success = 1 AND executed_at >= ?",
        )
        .bind(from_broadcaster_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(targets)
    }

    /// Successful network raids this target has received, current raid
    /// included once its history row is written.
    pub async fn network_raid_count(&self, to_broadcaster_id: &str) -> RaidsResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM raid_history WHERE to_broadcaster_id = ? AND success = 1",
        )
        .bind(to_broadcaster_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn is_blacklisted(
        &self,
        target_id: &str,
        target_login: &str,
    ) -> RaidsResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM raid_blacklist \
             WHERE target_id = ? OR lower(target_login) = lower(?)",
        )
        .bind(target_id)
        .bind(target_login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn add_to_blacklist(
        &self,
        target_id: &str,
        target_login: &str,
        reason: &str,
    ) -> RaidsResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO raid_blacklist (target_id, target_login, reason) \
             VALUES (?, ?, ?)",
        )
        .bind(target_id)
        .bind(target_login)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        info!(target_login, target_id, reason, "added raid target to blacklist");
        Ok(())
    }

    /// Most recent attempts for an origin, newest first. Operator surface.
    pub async fn recent_attempts(
        &self,
        from_broadcaster_id: &str,
        limit: u32,
    ) -> RaidsResult<Vec<RaidAttempt>> {
        let rows = sqlx::query(
            "SELECT from_broadcaster_id, from_broadcaster_login, to_broadcaster_id, \
                    to_broadcaster_login, viewer_count, stream_duration_sec, reason, \
                    success, error_message, target_stream_started_at, candidates_count \
             FROM raid_history WHERE from_broadcaster_id = ? \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(from_broadcaster_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RaidAttempt {
                from_broadcaster_id: row.get("from_broadcaster_id"),
                from_broadcaster_login: row.get("from_broadcaster_login"),
                to_broadcaster_id: row.get("to_broadcaster_id"),
                to_broadcaster_login: row.get("to_broadcaster_login"),
                viewer_count: row.get("viewer_count"),
                stream_duration_sec: row.get("stream_duration_sec"),
                reason: row.get("reason"),
                success: row.get("success"),
                error_message: row.get("error_message"),
                target_stream_started_at: row.get("target_stream_started_at"),
                candidates_count: row.get("candidates_count"),
            })
            .collect())
    }
}
