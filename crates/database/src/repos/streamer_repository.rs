//! Streamer repository for database operations.

use crate::entities::streamer::{Streamer, StreamerUpsert};
use crate::types::DatabaseResult;
use sqlx::{Row, SqlitePool};

/// Repository for the shared streamer table.
#[derive(Clone)]
pub struct StreamerRepository {
    pool: SqlitePool,
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Streamer {
    Streamer {
        twitch_login: row.get("twitch_login"),
        twitch_user_id: row.get("twitch_user_id"),
        discord_user_id: row.get("discord_user_id"),
        discord_display_name: row.get("discord_display_name"),
        opt_out: row.get("opt_out"),
        auto_raid_enabled: row.get("auto_raid_enabled"),
        silent_raid: row.get("silent_raid"),
        verified_permanent: row.get("verified_permanent"),
        verified_until: row.get("verified_until"),
        verified_at: row.get("verified_at"),
        created_at: row.get("created_at"),
    }
}

const SELECT_COLUMNS: &str = "twitch_login, twitch_user_id, discord_user_id, \
     discord_display_name, opt_out, auto_raid_enabled, silent_raid, verified_permanent, \
     verified_until, verified_at, created_at";

impl StreamerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the streamer row on first observation; backfill the platform
    /// user id if a later observation learns it.
    pub async fn ensure_observed(&self, upsert: &StreamerUpsert) -> DatabaseResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO streamers (twitch_login, twitch_user_id) VALUES (?, ?)",
        )
        .bind(&upsert.twitch_login)
        .bind(&upsert.twitch_user_id)
        .execute(&self.pool)
        .await?;

        if let Some(user_id) = &upsert.twitch_user_id {
            sqlx::query(
                "UPDATE streamers SET twitch_user_id = ? \
                 WHERE twitch_login = ? AND (twitch_user_id IS NULL OR twitch_user_id = '')",
            )
            .bind(user_id)
            .bind(&upsert.twitch_login)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn find_by_login(&self, login: &str) -> DatabaseResult<Option<Streamer>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM streamers WHERE twitch_login = ?"
        ))
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(map_row))
    }

    pub async fn find_by_user_id(&self, user_id: &str) -> DatabaseResult<Option<Streamer>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM streamers WHERE twitch_user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(map_row))
    }

    /// Resolve a login to the stored platform user id.
    pub async fn resolve_user_id(&self, login: &str) -> DatabaseResult<Option<String>> {
        let row: Option<Option<String>> = sqlx::query_scalar(
            "SELECT twitch_user_id FROM streamers WHERE twitch_login = ?",
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.flatten().filter(|id| !id.is_empty()))
    }

    /// Logins the live-state poll explicitly tracks.
    pub async fn tracked_logins(&self) -> DatabaseResult<Vec<String>> {
        let logins = sqlx::query_scalar("SELECT twitch_login FROM streamers ORDER BY twitch_login")
            .fetch_all(&self.pool)
            .await?;
        Ok(logins)
    }

    pub async fn set_discord_link(
        &self,
        login: &str,
        discord_user_id: Option<&str>,
        display_name: Option<&str>,
    ) -> DatabaseResult<()> {
        sqlx::query(
            "UPDATE streamers SET discord_user_id = ?, discord_display_name = ? \
             WHERE twitch_login = ?",
        )
        .bind(discord_user_id)
        .bind(display_name)
        .bind(login)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_opt_out(&self, login: &str, opt_out: bool) -> DatabaseResult<()> {
        sqlx::query("UPDATE streamers SET opt_out = ? WHERE twitch_login = ?")
            .bind(opt_out)
            .bind(login)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_silent_raid(&self, login: &str, silent: bool) -> DatabaseResult<()> {
        sqlx::query("UPDATE streamers SET silent_raid = ? WHERE twitch_login = ?")
            .bind(silent)
            .bind(login)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether the broadcaster suppressed post-raid chat messages.
    pub async fn is_silent_raid(&self, login: &str) -> DatabaseResult<bool> {
        let silent: Option<bool> =
            sqlx::query_scalar("SELECT silent_raid FROM streamers WHERE twitch_login = ?")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;
        Ok(silent.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{initialize_database, StreamerUpsert};
    use streamnet_config::DatabaseConfig;
    use tempfile::TempDir;

    async fn test_repo() -> (StreamerRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite:{}", temp_dir.path().join("test.db").display()),
            max_connections: 1,
        };
        let pool = initialize_database(&config).await.unwrap();
        (StreamerRepository::new(pool), temp_dir)
    }

    #[tokio::test]
    async fn test_ensure_observed_creates_once_and_backfills_user_id() {
        let (repo, _tmp) = test_repo().await;

        repo.ensure_observed(&StreamerUpsert {
            twitch_login: "alice".into(),
            twitch_user_id: None,
        })
        .await
        .unwrap();

        repo.ensure_observed(&StreamerUpsert {
            twitch_login: "alice".into(),
            twitch_user_id: Some("100".into()),
        })
        .await
        .unwrap();

        let streamer = repo.find_by_login("alice").await.unwrap().unwrap();
        assert_eq!(streamer.twitch_user_id.as_deref(), Some("100"));
        assert!(!streamer.auto_raid_enabled);
    }

    #[tokio::test]
    async fn test_login_lookup_is_case_insensitive() {
        let (repo, _tmp) = test_repo().await;

        repo.ensure_observed(&StreamerUpsert {
            twitch_login: "Alice".into(),
            twitch_user_id: Some("100".into()),
        })
        .await
        .unwrap();

        assert!(repo.find_by_login("alice").await.unwrap().is_some());
        assert!(repo.find_by_login("ALICE").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_silent_raid_flag_roundtrip() {
        let (repo, _tmp) = test_repo().await;

        repo.ensure_observed(&StreamerUpsert {
            twitch_login: "dave".into(),
            twitch_user_id: Some("400".into()),
        })
        .await
        .unwrap();

        assert!(!repo.is_silent_raid("dave").await.unwrap());
        repo.set_silent_raid("dave", true).await.unwrap();
        assert!(repo.is_silent_raid("dave").await.unwrap());
    }
}
