//! Forward-only, idempotent schema migrations.
//!
//! Tables are created `IF NOT EXISTS`; columns added in later versions are
//! guarded by `PRAGMA table_info` introspection so the same code can upgrade
//! any older database in place.

use std::collections::HashSet;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::info;

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_base_tables(pool).await?;
    add_incremental_columns(pool).await?;
    create_indexes(pool).await?;
    info!("database migrations applied");
    Ok(())
}

async fn columns(pool: &SqlitePool, table: &str) -> Result<HashSet<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to introspect table {table}"))?;
    Ok(rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    name: &str,
    spec: &str,
) -> Result<()> {
    let existing = columns(pool, table).await?;
    if !existing.contains(name) {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {name} {spec}"))
            .execute(pool)
            .await
            .with_context(|| format!("failed to add column {table}.{name}"))?;
        info!(table, column = name, "added column");
    }
    Ok(())
}

async fn create_base_tables(pool: &SqlitePool) -> Result<()> {
    // 1) streamers: anchor record per broadcaster, keyed by login.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS streamers (
            twitch_login         TEXT PRIMARY KEY COLLATE NOCASE,
            twitch_user_id       TEXT,
            discord_user_id      TEXT,
            discord_display_name TEXT,
            opt_out              INTEGER NOT NULL DEFAULT 0,
            auto_raid_enabled    INTEGER NOT NULL DEFAULT 0,
            verified_permanent   INTEGER NOT NULL DEFAULT 0,
            verified_until       TEXT,
            verified_at          TEXT,
            created_at           TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create streamers table")?;

    // 2) credential_grants: one OAuth grant per broadcaster; token columns
    // hold AES-GCM blobs only.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credential_grants (
            twitch_user_id    TEXT PRIMARY KEY,
            twitch_login      TEXT NOT NULL,
            access_token_enc  BLOB,
            refresh_token_enc BLOB,
            enc_version       INTEGER NOT NULL DEFAULT 1,
            enc_kid           TEXT NOT NULL DEFAULT 'v1',
            token_expires_at  TEXT NOT NULL,
            scopes            TEXT NOT NULL DEFAULT '',
            raid_enabled      INTEGER NOT NULL DEFAULT 1,
            authorized_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            last_refreshed_at TEXT,
            created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create credential_grants table")?;

    // 3) credential_failures: refresh-failure ledger with grace bookkeeping.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credential_failures (
            twitch_user_id   TEXT PRIMARY KEY,
            twitch_login     TEXT NOT NULL,
            error_count      INTEGER NOT NULL DEFAULT 1,
            error_message    TEXT,
            first_error_at   TEXT NOT NULL,
            last_error_at    TEXT NOT NULL,
            grace_expires_at TEXT,
            admin_notified   INTEGER NOT NULL DEFAULT 0,
            user_dm_sent     INTEGER NOT NULL DEFAULT 0,
            reminder_sent    INTEGER NOT NULL DEFAULT 0,
            role_removed     INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create credential_failures table")?;

    // 4) live_state: exactly one row per broadcaster.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS live_state (
            twitch_user_id    TEXT PRIMARY KEY,
            streamer_login    TEXT NOT NULL,
            is_live           INTEGER NOT NULL DEFAULT 0,
            active_session_id INTEGER,
            last_started_at   TEXT,
            last_seen_at      TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create live_state table")?;

    // 5) stream_sessions: one row per observed stream interval.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_sessions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            streamer_login      TEXT NOT NULL,
            stream_id           TEXT,
            started_at          TEXT NOT NULL,
            ended_at            TEXT,
            duration_seconds    INTEGER NOT NULL DEFAULT 0,
            start_viewers       INTEGER NOT NULL DEFAULT 0,
            peak_viewers        INTEGER NOT NULL DEFAULT 0,
            end_viewers         INTEGER NOT NULL DEFAULT 0,
            avg_viewers         REAL NOT NULL DEFAULT 0,
            samples             INTEGER NOT NULL DEFAULT 0,
            retention_5m        REAL,
            retention_10m       REAL,
            retention_20m       REAL,
            dropoff_pct         REAL,
            dropoff_label       TEXT,
            unique_chatters     INTEGER NOT NULL DEFAULT 0,
            first_time_chatters INTEGER NOT NULL DEFAULT 0,
            returning_chatters  INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create stream_sessions table")?;

    // 6) session_samples: append-only viewer series; composite key drops
    // duplicate ticks.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_samples (
            session_id         INTEGER NOT NULL,
            ts_utc             TEXT    NOT NULL,
            minutes_from_start INTEGER NOT NULL DEFAULT 0,
            viewer_count       INTEGER NOT NULL,
            PRIMARY KEY (session_id, ts_utc)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create session_samples table")?;

    // 7) session_chatters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_chatters (
            session_id           INTEGER NOT NULL,
            streamer_login       TEXT    NOT NULL,
            chatter_login        TEXT    NOT NULL,
            first_seen_at        TEXT    NOT NULL,
            last_seen_at         TEXT    NOT NULL,
            messages             INTEGER NOT NULL DEFAULT 0,
            is_first_time_global INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, chatter_login)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create session_chatters table")?;

    // 8) raid_history: append-only log of every raid attempt.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raid_history (
            id                       INTEGER PRIMARY KEY AUTOINCREMENT,
            from_broadcaster_id      TEXT NOT NULL,
            from_broadcaster_login   TEXT NOT NULL,
            to_broadcaster_id        TEXT NOT NULL,
            to_broadcaster_login     TEXT NOT NULL,
            viewer_count             INTEGER NOT NULL DEFAULT 0,
            stream_duration_sec      INTEGER,
            reason                   TEXT NOT NULL DEFAULT 'auto_raid_on_offline',
            executed_at              TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
            success                  INTEGER NOT NULL DEFAULT 1,
            error_message            TEXT,
            target_stream_started_at TEXT,
            candidates_count         INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create raid_history table")?;

    // 9) raid_blacklist: targets that refused raids.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raid_blacklist (
            target_id    TEXT PRIMARY KEY,
            target_login TEXT NOT NULL,
            reason       TEXT,
            created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create raid_blacklist table")?;

    // 10) event_history: append-only record of passthrough platform events.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_history (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type          TEXT NOT NULL,
            broadcaster_user_id TEXT,
            payload             TEXT NOT NULL,
            received_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create event_history table")?;

    Ok(())
}

/// Columns introduced after the base schema shipped. Guarded by introspection
/// so existing databases upgrade in place.
async fn add_incremental_columns(pool: &SqlitePool) -> Result<()> {
    add_column_if_missing(pool, "streamers", "silent_raid", "INTEGER NOT NULL DEFAULT 0").await?;

    add_column_if_missing(
        pool,
        "credential_grants",
        "needs_reauth",
        "INTEGER NOT NULL DEFAULT 0",
    )
    .await?;
    add_column_if_missing(pool, "credential_grants", "legacy_scopes", "TEXT").await?;
    add_column_if_missing(pool, "credential_grants", "legacy_saved_at", "TEXT").await?;

    add_column_if_missing(pool, "live_state", "last_title", "TEXT").await?;
    add_column_if_missing(pool, "live_state", "last_category", "TEXT").await?;
    add_column_if_missing(
        pool,
        "live_state",
        "last_viewer_count",
        "INTEGER NOT NULL DEFAULT 0",
    )
    .await?;

    add_column_if_missing(pool, "stream_sessions", "follower_delta", "INTEGER").await?;

    Ok(())
}

async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_streamers_user_id ON streamers(twitch_user_id)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_credential_grants_login \
         ON credential_grants(twitch_login COLLATE NOCASE)",
        "CREATE INDEX IF NOT EXISTS idx_stream_sessions_login \
         ON stream_sessions(streamer_login, started_at)",
        "CREATE INDEX IF NOT EXISTS idx_stream_sessions_open \
         ON stream_sessions(streamer_login) WHERE ended_at IS NULL",
        "CREATE INDEX IF NOT EXISTS idx_session_samples_session \
         ON session_samples(session_id)",
        "CREATE INDEX IF NOT EXISTS idx_session_chatters_login \
         ON session_chatters(streamer_login, session_id)",
        "CREATE INDEX IF NOT EXISTS idx_raid_history_from ON raid_history(from_broadcaster_id)",
        "CREATE INDEX IF NOT EXISTS idx_raid_history_to ON raid_history(to_broadcaster_id)",
        "CREATE INDEX IF NOT EXISTS idx_raid_history_executed ON raid_history(executed_at)",
        "CREATE INDEX IF NOT EXISTS idx_event_history_type \
         ON event_history(event_type, received_at)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create index: {statement}"))?;
    }

    Ok(())
}
