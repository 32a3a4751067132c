//! Streamer anchor record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per broadcaster, keyed by the platform login (case-insensitive).
/// Created on first observation and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Streamer {
    pub twitch_login: String,
    pub twitch_user_id: Option<String>,
    pub discord_user_id: Option<String>,
    pub discord_display_name: Option<String>,
    pub opt_out: bool,
    pub auto_raid_enabled: bool,
    pub silent_raid: bool,
    pub verified_permanent: bool,
    pub verified_until: Option<String>,
    pub verified_at: Option<String>,
    pub created_at: String,
}

impl Streamer {
    /// Whether the broadcaster currently counts as an active partner.
    ///
    /// Derived, never stored: permanent verification or an unexpired
    /// time-limited verification, and no opt-out.
    pub fn partner_active(&self) -> bool {
        if self.opt_out {
            return false;
        }
        if self.verified_permanent {
            return true;
        }
        match &self.verified_until {
            Some(until) => until
                .parse::<DateTime<Utc>>()
                .map(|t| t > Utc::now())
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Fields for creating or refreshing a streamer row on observation.
#[derive(Debug, Clone, Default)]
pub struct StreamerUpsert {
    pub twitch_login: String,
    pub twitch_user_id: Option<String>,
}
