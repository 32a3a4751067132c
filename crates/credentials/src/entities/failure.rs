//! Refresh-failure ledger entities.

use chrono::{DateTime, Utc};

/// One row per broadcaster currently in a failure state. Deleted again after
/// a successful refresh or re-authorization.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub twitch_user_id: String,
    pub twitch_login: String,
    pub error_count: u32,
    pub error_message: Option<String>,
    pub first_error_at: DateTime<Utc>,
    pub last_error_at: DateTime<Utc>,
    pub grace_expires_at: Option<DateTime<Utc>>,
    pub admin_notified: bool,
    pub user_dm_sent: bool,
    pub reminder_sent: bool,
    pub role_removed: bool,
}

/// What a `record_failure` call did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub error_count: u32,
    /// True exactly when this failure pushed the count across the disable
    /// threshold and auto-raid was switched off.
    pub disabled_now: bool,
}
