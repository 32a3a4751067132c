//! Append-only repository for passthrough platform events.

use crate::entities::event::EventRecord;
use crate::types::DatabaseResult;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an inbound notification. Rows are never updated or deleted.
    pub async fn record(
        &self,
        event_type: &str,
        broadcaster_user_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT INTO event_history (event_type, broadcaster_user_id, payload) VALUES (?, ?, ?)",
        )
        .bind(event_type)
        .bind(broadcaster_user_id)
        .bind(payload.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent events of a type, newest first.
    pub async fn recent(&self, event_type: &str, limit: u32) -> DatabaseResult<Vec<EventRecord>> {
        let rows = sqlx::query(
            "SELECT id, event_type, broadcaster_user_id, payload, received_at \
             FROM event_history WHERE event_type = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(event_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| EventRecord {
                id: row.get("id"),
                event_type: row.get("event_type"),
                broadcaster_user_id: row.get("broadcaster_user_id"),
                payload: row.get("payload"),
                received_at: row.get("received_at"),
            })
            .collect())
    }
}
