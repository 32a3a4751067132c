//! Credential grant entities.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

/// A fully decrypted grant as handed to token consumers.
#[derive(Debug, Clone)]
pub struct DecryptedGrant {
    pub twitch_user_id: String,
    pub twitch_login: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
}

impl DecryptedGrant {
    /// Whether the access token is still usable outside the safety window.
    pub fn valid_for(&self, safety: chrono::Duration) -> bool {
        Utc::now() < self.expires_at - safety
    }
}

/// Grant metadata without token material, as scanned by the refresher.
#[derive(Debug, Clone)]
pub struct GrantSummary {
    pub twitch_user_id: String,
    pub twitch_login: String,
    pub expires_at: DateTime<Utc>,
    pub raid_enabled: bool,
    pub needs_reauth: bool,
}

/// Operator-facing counts over the grant table.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantOverview {
    pub total: i64,
    pub raid_enabled: i64,
    pub needs_reauth: i64,
}
