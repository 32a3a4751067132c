//! Credential repository: the grant table and the failure ledger.
//!
//! Token columns hold AES-GCM blobs bound to
//! `credential_grants|{column}|{twitch_user_id}|{enc_version}`. Writes are
//! fail-closed: if either field fails to encrypt, the row is not touched, so
//! a broadcaster is never locked out by a half-written grant.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use streamnet_config::PartnershipConfig;
use streamnet_crypto::{field_aad, CryptoError, FieldCipher};
use tracing::{debug, info, warn};

use crate::entities::{
    DecryptedGrant, FailureOutcome, FailureRecord, GrantOverview, GrantSummary,
};
use crate::types::{CredentialError, CredentialResult};

const GRANTS_TABLE: &str = "credential_grants";

#[derive(Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
    cipher: Arc<FieldCipher>,
    config: PartnershipConfig,
}

fn parse_ts(raw: &str, column: &str) -> CredentialResult<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|_| CredentialError::InvalidTimestamp(column.to_string()))
}

fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

fn map_failure_row(row: &sqlx::sqlite::SqliteRow) -> CredentialResult<FailureRecord> {
    Ok(FailureRecord {
        twitch_user_id: row.get("twitch_user_id"),
        twitch_login: row.get("twitch_login"),
        error_count: row.get::<i64, _>("error_count").max(0) as u32,
        error_message: row.get("error_message"),
        first_error_at: parse_ts(&row.get::<String, _>("first_error_at"), "first_error_at")?,
        last_error_at: parse_ts(&row.get::<String, _>("last_error_at"), "last_error_at")?,
        grace_expires_at: parse_opt_ts(row.get("grace_expires_at")),
        admin_notified: row.get("admin_notified"),
        user_dm_sent: row.get("user_dm_sent"),
        reminder_sent: row.get("reminder_sent"),
        role_removed: row.get("role_removed"),
    })
}

impl CredentialRepository {
    pub fn new(pool: SqlitePool, cipher: Arc<FieldCipher>, config: PartnershipConfig) -> Self {
        Self {
            pool,
            cipher,
            config,
        }
    }

    pub fn config(&self) -> &PartnershipConfig {
        &self.config
    }

    fn encrypt_pair(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        enc_version: i64,
    ) -> CredentialResult<(Vec<u8>, Vec<u8>)> {
        let access_enc = self
            .cipher
            .encrypt(
                access_token,
                &field_aad(GRANTS_TABLE, "access_token", user_id, enc_version),
            )
            .map_err(|_| CredentialError::EncryptFailed(user_id.to_string()))?;
        let refresh_enc = self
            .cipher
            .encrypt(
                refresh_token,
                &field_aad(GRANTS_TABLE, "refresh_token", user_id, enc_version),
            )
            .map_err(|_| CredentialError::EncryptFailed(user_id.to_string()))?;
        Ok((access_enc, refresh_enc))
    }

    fn decrypt_field(
        &self,
        blob: Option<Vec<u8>>,
        column: &str,
        user_id: &str,
        enc_version: i64,
    ) -> CredentialResult<String> {
        let blob = blob.ok_or_else(|| CredentialError::DecryptFailed(user_id.to_string()))?;
        self.cipher
            .decrypt(&blob, &field_aad(GRANTS_TABLE, column, user_id, enc_version))
            .map_err(|err| match err {
                CryptoError::KeyMissing(kid) => {
                    warn!(user_id, kid, column, "decryption key missing for grant field");
                    CredentialError::DecryptFailed(user_id.to_string())
                }
                _ => CredentialError::DecryptFailed(user_id.to_string()),
            })
    }

    /// Upsert a grant after a successful OAuth code exchange.
    ///
    /// One transaction: the grant row, the partner flags on the streamer row,
    /// and the removal of any failure record all land together.
    pub async fn save_grant(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: u64,
        scopes: &[String],
    ) -> CredentialResult<()> {
        let (access_enc, refresh_enc) =
            self.encrypt_pair(twitch_user_id, access_token, refresh_token, 1)?;

        let now = Utc::now();
        let expires_at = (now + Duration::seconds(expires_in_secs as i64)).to_rfc3339();
        let scopes_joined = scopes.join(" ");

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO credential_grants \
             (twitch_user_id, twitch_login, access_token_enc, refresh_token_enc, \
              enc_version, enc_kid, token_expires_at, scopes, raid_enabled, \
              needs_reauth, legacy_scopes, legacy_saved_at, authorized_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?, ?, 1, 0, NULL, NULL, ?) \
             ON CONFLICT(twitch_user_id) DO UPDATE SET \
              twitch_login = excluded.twitch_login, \
              access_token_enc = excluded.access_token_enc, \
              refresh_token_enc = excluded.refresh_token_enc, \
              enc_version = excluded.enc_version, \
              enc_kid = excluded.enc_kid, \
              token_expires_at = excluded.token_expires_at, \
              scopes = excluded.scopes, \
              raid_enabled = 1, \
              needs_reauth = 0, \
              legacy_scopes = NULL, \
              legacy_saved_at = NULL, \
              authorized_at = excluded.authorized_at",
        )
        .bind(twitch_user_id)
        .bind(twitch_login)
        .bind(&access_enc)
        .bind(&refresh_enc)
        .bind(self.cipher.default_kid())
        .bind(&expires_at)
        .bind(&scopes_joined)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        // Authorization doubles as partner verification: enable auto-raid and
        // clear any opt-out immediately.
        sqlx::query(
            "INSERT INTO streamers \
             (twitch_login, twitch_user_id, auto_raid_enabled, verified_permanent, \
              verified_until, verified_at, opt_out) \
             VALUES (?, ?, 1, 1, NULL, ?, 0) \
             ON CONFLICT(twitch_login) DO UPDATE SET \
              twitch_user_id = excluded.twitch_user_id, \
              auto_raid_enabled = 1, \
              verified_permanent = 1, \
              verified_until = NULL, \
              verified_at = COALESCE(streamers.verified_at, excluded.verified_at), \
              opt_out = 0",
        )
        .bind(twitch_login)
        .bind(twitch_user_id)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM credential_failures WHERE twitch_user_id = ?")
            .bind(twitch_user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(login = twitch_login, user_id = twitch_user_id, "saved credential grant");
        Ok(())
    }

    /// Load and decrypt a grant. A decryption failure is terminal for the
    /// caller; the row stays in place for operator inspection.
    pub async fn load_grant(&self, twitch_user_id: &str) -> CredentialResult<DecryptedGrant> {
        let row = sqlx::query(
            "SELECT twitch_login, access_token_enc, refresh_token_enc, enc_version, \
                    token_expires_at, scopes \
             FROM credential_grants WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CredentialError::GrantNotFound(twitch_user_id.to_string()))?;

        let enc_version: i64 = row.get("enc_version");
        let access_token = self.decrypt_field(
            row.get("access_token_enc"),
            "access_token",
            twitch_user_id,
            enc_version,
        )?;
        let refresh_token = self.decrypt_field(
            row.get("refresh_token_enc"),
            "refresh_token",
            twitch_user_id,
            enc_version,
        )?;

        let scopes_raw: String = row.get("scopes");

        Ok(DecryptedGrant {
            twitch_user_id: twitch_user_id.to_string(),
            twitch_login: row.get("twitch_login"),
            access_token,
            refresh_token,
            expires_at: parse_ts(&row.get::<String, _>("token_expires_at"), "token_expires_at")?,
            scopes: scopes_raw
                .split_whitespace()
                .map(|s| s.to_lowercase())
                .collect(),
        })
    }

    /// Atomically replace the token pair after a refresh. Both ciphertexts
    /// are produced before the single UPDATE; an encryption failure leaves
    /// the row unmodified.
    pub async fn write_refresh(
        &self,
        twitch_user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> CredentialResult<()> {
        let (access_enc, refresh_enc) =
            self.encrypt_pair(twitch_user_id, access_token, refresh_token, 1)?;

        let result = sqlx::query(
            "UPDATE credential_grants \
             SET access_token_enc = ?, refresh_token_enc = ?, enc_version = 1, enc_kid = ?, \
                 token_expires_at = ?, last_refreshed_at = ? \
             WHERE twitch_user_id = ?",
        )
        .bind(&access_enc)
        .bind(&refresh_enc)
        .bind(self.cipher.default_kid())
        .bind(expires_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(twitch_user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CredentialError::GrantNotFound(twitch_user_id.to_string()));
        }

        debug!(user_id = twitch_user_id, "grant refreshed");
        Ok(())
    }

    /// Normalized lowercase scope set; empty when no grant exists.
    pub async fn get_scopes(&self, twitch_user_id: &str) -> CredentialResult<BTreeSet<String>> {
        let scopes: Option<String> =
            sqlx::query_scalar("SELECT scopes FROM credential_grants WHERE twitch_user_id = ?")
                .bind(twitch_user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(scopes
            .unwrap_or_default()
            .split_whitespace()
            .map(|s| s.to_lowercase())
            .collect())
    }

    /// Delete the grant and clear partnership flags. Returns the linked
    /// discord user id so the caller can schedule role removal.
    pub async fn revoke(&self, twitch_user_id: &str) -> CredentialResult<Option<String>> {
        let mut tx = self.pool.begin().await?;

        let discord_user_id: Option<String> = sqlx::query_scalar(
            "SELECT discord_user_id FROM streamers WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .flatten();

        sqlx::query("DELETE FROM credential_grants WHERE twitch_user_id = ?")
            .bind(twitch_user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE streamers \
             SET auto_raid_enabled = 0, verified_permanent = 0, verified_until = NULL, \
                 verified_at = NULL, opt_out = 1 \
             WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM credential_failures WHERE twitch_user_id = ?")
            .bind(twitch_user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(user_id = twitch_user_id, "revoked credential grant");
        Ok(discord_user_id.filter(|id| !id.is_empty()))
    }

    /// Toggle auto-raid on the grant and mirror the flag into the streamer row.
    pub async fn set_raid_enabled(
        &self,
        twitch_user_id: &str,
        enabled: bool,
    ) -> CredentialResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE credential_grants SET raid_enabled = ? WHERE twitch_user_id = ?")
            .bind(enabled)
            .bind(twitch_user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE streamers SET auto_raid_enabled = ? WHERE twitch_user_id = ?")
            .bind(enabled)
            .bind(twitch_user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(user_id = twitch_user_id, enabled, "set raid_enabled");
        Ok(())
    }

    pub async fn has_enabled_grant(&self, twitch_user_id: &str) -> CredentialResult<bool> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT raid_enabled FROM credential_grants WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enabled.unwrap_or(false))
    }

    /// True iff the failure count reached the disable threshold.
    pub async fn is_blacklisted(&self, twitch_user_id: &str) -> CredentialResult<bool> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT error_count FROM credential_failures WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0) >= i64::from(self.config.disable_threshold))
    }

    /// True iff the last failure is inside the retry cooldown and the
    /// broadcaster is not yet blacklisted (that case is handled separately).
    pub async fn has_recent_failure(&self, twitch_user_id: &str) -> CredentialResult<bool> {
        let row = sqlx::query(
            "SELECT error_count, last_error_at FROM credential_failures WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let count: i64 = row.get("error_count");
        if count >= i64::from(self.config.disable_threshold) {
            return Ok(false);
        }

        let last_error_at = parse_ts(&row.get::<String, _>("last_error_at"), "last_error_at")?;
        Ok(Utc::now() - last_error_at < Duration::hours(self.config.retry_cooldown_hours as i64))
    }

    /// Record an invalid-grant refresh failure.
    ///
    /// First failure creates the ledger row with the grace clock started.
    /// A failure older than the consecutive window resets the count to one
    /// and re-arms the admin notification; otherwise the count increments.
    /// Crossing the disable threshold switches auto-raid off (grant and
    /// streamer row) but never deletes the grant.
    pub async fn record_failure(
        &self,
        twitch_user_id: &str,
        twitch_login: &str,
        error_message: &str,
    ) -> CredentialResult<FailureOutcome> {
        let now = Utc::now();
        let window = Duration::hours(self.config.failure_window_hours as i64);

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT error_count, last_error_at FROM credential_failures WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let new_count: u32 = match existing {
            None => {
                let grace_expires =
                    now + Duration::days(self.config.grace_period_days as i64);
                sqlx::query(
                    "INSERT INTO credential_failures \
                     (twitch_user_id, twitch_login, error_count, error_message, \
                      first_error_at, last_error_at, grace_expires_at) \
                     VALUES (?, ?, 1, ?, ?, ?, ?)",
                )
                .bind(twitch_user_id)
                .bind(twitch_login)
                .bind(error_message)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(grace_expires.to_rfc3339())
                .execute(&mut *tx)
                .await?;
                1
            }
            Some(row) => {
                let prior: i64 = row.get("error_count");
                let last_error_at =
                    parse_ts(&row.get::<String, _>("last_error_at"), "last_error_at")?;

                if now - last_error_at > window {
                    sqlx::query(
                        "UPDATE credential_failures \
                         SET error_count = 1, first_error_at = ?, last_error_at = ?, \
                             error_message = ?, admin_notified = 0 \
                         WHERE twitch_user_id = ?",
                    )
                    .bind(now.to_rfc3339())
                    .bind(now.to_rfc3339())
                    .bind(error_message)
                    .bind(twitch_user_id)
                    .execute(&mut *tx)
                    .await?;
                    info!(
                        login = twitch_login,
                        window_hours = self.config.failure_window_hours,
                        "failure counter reset after quiet window"
                    );
                    1
                } else {
                    let count = prior.max(0) as u32 + 1;
                    sqlx::query(
                        "UPDATE credential_failures \
                         SET error_count = ?, last_error_at = ?, error_message = ? \
                         WHERE twitch_user_id = ?",
                    )
                    .bind(i64::from(count))
                    .bind(now.to_rfc3339())
                    .bind(error_message)
                    .bind(twitch_user_id)
                    .execute(&mut *tx)
                    .await?;
                    count
                }
            }
        };

        let mut disabled_now = false;
        if new_count >= self.config.disable_threshold {
            let grant_update =
                sqlx::query("UPDATE credential_grants SET raid_enabled = 0 WHERE twitch_user_id = ? AND raid_enabled = 1")
                    .bind(twitch_user_id)
                    .execute(&mut *tx)
                    .await?;
            disabled_now = grant_update.rows_affected() > 0;

            sqlx::query("UPDATE streamers SET auto_raid_enabled = 0 WHERE twitch_user_id = ?")
                .bind(twitch_user_id)
                .execute(&mut *tx)
                .await?;

            // The grace clock starts at the first failure; make sure it exists
            // even if the row predates the grace column.
            sqlx::query(
                "UPDATE credential_failures SET grace_expires_at = ? \
                 WHERE twitch_user_id = ? AND grace_expires_at IS NULL",
            )
            .bind((now + Duration::days(self.config.grace_period_days as i64)).to_rfc3339())
            .bind(twitch_user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        warn!(
            login = twitch_login,
            count = new_count,
            threshold = self.config.disable_threshold,
            "recorded refresh failure"
        );

        Ok(FailureOutcome {
            error_count: new_count,
            disabled_now,
        })
    }

    /// Delete the failure record after a successful refresh.
    pub async fn clear_failure(&self, twitch_user_id: &str) -> CredentialResult<()> {
        sqlx::query("DELETE FROM credential_failures WHERE twitch_user_id = ?")
            .bind(twitch_user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn failure(&self, twitch_user_id: &str) -> CredentialResult<Option<FailureRecord>> {
        let row = sqlx::query(
            "SELECT twitch_user_id, twitch_login, error_count, error_message, first_error_at, \
                    last_error_at, grace_expires_at, admin_notified, user_dm_sent, \
                    reminder_sent, role_removed \
             FROM credential_failures WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_failure_row).transpose()
    }

    /// Failure records whose grace period has expired and whose role has not
    /// been removed yet. The grace controller's hourly work list.
    pub async fn expired_grace_failures(&self) -> CredentialResult<Vec<FailureRecord>> {
        let rows = sqlx::query(
            "SELECT twitch_user_id, twitch_login, error_count, error_message, first_error_at, \
                    last_error_at, grace_expires_at, admin_notified, user_dm_sent, \
                    reminder_sent, role_removed \
             FROM credential_failures \
             WHERE error_count >= ? \
               AND grace_expires_at IS NOT NULL \
               AND grace_expires_at <= ? \
               AND role_removed = 0",
        )
        .bind(i64::from(self.config.disable_threshold))
        .bind(Utc::now().to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_failure_row).collect()
    }

    async fn set_failure_flag(&self, twitch_user_id: &str, column: &str) -> CredentialResult<()> {
        // column is a compile-time constant at every call site
        sqlx::query(&format!(
            "UPDATE credential_failures SET {column} = 1 WHERE twitch_user_id = ?"
        ))
        .bind(twitch_user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_admin_notified(&self, twitch_user_id: &str) -> CredentialResult<()> {
        self.set_failure_flag(twitch_user_id, "admin_notified").await
    }

    pub async fn mark_user_dm_sent(&self, twitch_user_id: &str) -> CredentialResult<()> {
        self.set_failure_flag(twitch_user_id, "user_dm_sent").await
    }

    pub async fn mark_reminder_sent(&self, twitch_user_id: &str) -> CredentialResult<()> {
        self.set_failure_flag(twitch_user_id, "reminder_sent").await
    }

    pub async fn mark_role_removed(&self, twitch_user_id: &str) -> CredentialResult<()> {
        self.set_failure_flag(twitch_user_id, "role_removed").await
    }

    /// Grants with auto-raid enabled, as scanned by the refresher loop.
    pub async fn enabled_grants(&self) -> CredentialResult<Vec<GrantSummary>> {
        let rows = sqlx::query(
            "SELECT twitch_user_id, twitch_login, token_expires_at, raid_enabled, needs_reauth \
             FROM credential_grants WHERE raid_enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(GrantSummary {
                    twitch_user_id: row.get("twitch_user_id"),
                    twitch_login: row.get("twitch_login"),
                    expires_at: parse_ts(
                        &row.get::<String, _>("token_expires_at"),
                        "token_expires_at",
                    )?,
                    raid_enabled: row.get("raid_enabled"),
                    needs_reauth: row.get("needs_reauth"),
                })
            })
            .collect()
    }

    /// Current expiry for a grant; the refresher's double-check under the lock.
    pub async fn current_expiry(
        &self,
        twitch_user_id: &str,
    ) -> CredentialResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT token_expires_at FROM credential_grants WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|s| parse_ts(&s, "token_expires_at")).transpose()
    }

    /// Snapshot scopes and flag every grant for re-authorization. Used when
    /// the scope set changes and all broadcasters must pass through OAuth
    /// again.
    pub async fn flag_all_for_reauth(&self) -> CredentialResult<u64> {
        let result = sqlx::query(
            "UPDATE credential_grants \
             SET needs_reauth = 1, legacy_scopes = scopes, legacy_saved_at = ? \
             WHERE needs_reauth = 0",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!(count = result.rows_affected(), "flagged grants for re-authorization");
        Ok(result.rows_affected())
    }

    /// Drop legacy snapshots for grants that completed re-authorization.
    pub async fn clear_legacy_for_fully_authed(&self) -> CredentialResult<u64> {
        let result = sqlx::query(
            "UPDATE credential_grants \
             SET legacy_scopes = NULL, legacy_saved_at = NULL \
             WHERE needs_reauth = 0 \
               AND (legacy_scopes IS NOT NULL OR legacy_saved_at IS NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn overview(&self) -> CredentialResult<GrantOverview> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(raid_enabled), 0) AS raid_enabled, \
                    COALESCE(SUM(needs_reauth), 0) AS needs_reauth \
             FROM credential_grants",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(GrantOverview {
            total: row.get("total"),
            raid_enabled: row.get("raid_enabled"),
            needs_reauth: row.get("needs_reauth"),
        })
    }
}
