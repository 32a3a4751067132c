//! In-memory bookkeeping around dispatched raids.
//!
//! Two maps, both wall-clock based and process-local: pending raids waiting
//! for their arrival event, and manual-raid suppressions that keep the
//! auto-raid from double-firing when a human already raided. Neither survives
//! a restart; a lost pending entry only costs one courtesy chat message.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// Entries older than this are reaped whether or not an arrival was observed.
const PENDING_RAID_TIMEOUT_SECS: i64 = 300;

/// Suppression applied when this process dispatched a manual raid.
pub const MANUAL_SUPPRESSION_SECS: i64 = 300;

/// Suppression applied when an external raid was observed via the platform.
pub const EXTERNAL_SUPPRESSION_SECS: i64 = 180;

/// A raid successfully requested via the platform API but not yet observed
/// arriving at the target.
#[derive(Debug, Clone)]
pub struct PendingRaid {
    pub from_login: String,
    pub to_login: String,
    pub target_started_at: Option<String>,
    pub created_at: DateTime<Utc>,
    pub partner_raid: bool,
    pub viewer_count: i64,
}

#[derive(Default)]
pub struct PendingRaidBook {
    /// Keyed by target broadcaster id.
    pending: Mutex<HashMap<String, PendingRaid>>,
    /// Origin broadcaster id → suppression expiry.
    suppressions: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PendingRaidBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched raid awaiting its arrival event.
    pub fn register(&self, to_broadcaster_id: &str, raid: PendingRaid) {
        info!(
            from = %raid.from_login,
            to = %raid.to_login,
            to_id = to_broadcaster_id,
            partner = raid.partner_raid,
            "pending raid registered"
        );
        self.pending
            .lock()
            .expect("pending raid lock poisoned")
            .insert(to_broadcaster_id.to_string(), raid);
    }

    /// Look at the pending entry for a target without consuming it.
    pub fn peek(&self, to_broadcaster_id: &str) -> Option<PendingRaid> {
        self.pending
            .lock()
            .expect("pending raid lock poisoned")
            .get(to_broadcaster_id)
            .cloned()
    }

    /// Consume the entry for a target iff it was dispatched by `from_login`.
    /// A mismatching origin leaves the entry for the reaper.
    pub fn consume_if_from(&self, to_broadcaster_id: &str, from_login: &str) -> Option<PendingRaid> {
        let mut pending = self.pending.lock().expect("pending raid lock poisoned");
        let matches = pending
            .get(to_broadcaster_id)
            .map(|p| p.from_login.eq_ignore_ascii_case(from_login))
            .unwrap_or(false);

        if matches {
            pending.remove(to_broadcaster_id)
        } else {
            None
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending raid lock poisoned").len()
    }

    /// Drop entries older than the timeout. Returns the reaped entries so the
    /// caller can log them; a reaped entry means the arrival event never came.
    pub fn reap_stale(&self) -> Vec<(String, PendingRaid)> {
        let cutoff = Utc::now() - Duration::seconds(PENDING_RAID_TIMEOUT_SECS);
        let mut pending = self.pending.lock().expect("pending raid lock poisoned");

        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, raid)| raid.created_at < cutoff)
            .map(|(to_id, _)| to_id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|to_id| pending.remove_entry(&to_id))
            .collect()
    }

    /// Suppress offline auto-raids for an origin broadcaster.
    pub fn mark_suppressed(&self, origin_broadcaster_id: &str, ttl_secs: i64) {
        let until = Utc::now() + Duration::seconds(ttl_secs.max(0));
        debug!(origin = origin_broadcaster_id, ttl_secs, "manual-raid suppression set");
        self.suppressions
            .lock()
            .expect("suppression lock poisoned")
            .insert(origin_broadcaster_id.to_string(), until);
    }

    /// Whether an active suppression exists; expired entries are dropped on
    /// the way out.
    pub fn is_suppressed(&self, origin_broadcaster_id: &str) -> bool {
        let mut suppressions = self.suppressions.lock().expect("suppression lock poisoned");
        match suppressions.get(origin_broadcaster_id) {
            Some(until) if *until > Utc::now() => true,
            Some(_) => {
                suppressions.remove(origin_broadcaster_id);
                false
            }
            None => false,
        }
    }

    pub fn reap_expired_suppressions(&self) {
        let now = Utc::now();
        let mut suppressions = self.suppressions.lock().expect("suppression lock poisoned");
        let before = suppressions.len();
        suppressions.retain(|_, until| *until > now);
        let reaped = before - suppressions.len();
        if reaped > 0 {
            debug!(reaped, "expired manual-raid suppressions dropped");
        }
    }
}

/// Log reaped entries; called from the periodic maintenance tick.
pub fn log_reaped(reaped: &[(String, PendingRaid)]) {
    for (to_id, raid) in reaped {
        let age = (Utc::now() - raid.created_at).num_seconds();
        warn!(
            from = %raid.from_login,
            to = %raid.to_login,
            to_id = %to_id,
            age_secs = age,
            "pending raid timed out, arrival event never came"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raid(from: &str, created_at: DateTime<Utc>) -> PendingRaid {
        PendingRaid {
            from_login: from.to_string(),
            to_login: "dave".to_string(),
            target_started_at: None,
            created_at,
            partner_raid: true,
            viewer_count: 42,
        }
    }

    #[test]
    fn consume_requires_matching_origin() {
        let book = PendingRaidBook::new();
        book.register("400", raid("alice", Utc::now()));

        assert!(book.consume_if_from("400", "mallory").is_none());
        assert_eq!(book.pending_count(), 1, "mismatch must leave the entry");

        let consumed = book.consume_if_from("400", "Alice").unwrap();
        assert_eq!(consumed.viewer_count, 42);
        assert_eq!(book.pending_count(), 0);

        // Second identical arrival finds nothing.
        assert!(book.consume_if_from("400", "alice").is_none());
    }

    #[test]
    fn stale_entries_are_reaped_fresh_ones_kept() {
        let book = PendingRaidBook::new();
        book.register("400", raid("alice", Utc::now() - Duration::seconds(301)));
        book.register("500", raid("bob", Utc::now()));

        let reaped = book.reap_stale();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, "400");
        assert_eq!(book.pending_count(), 1);
    }

    #[test]
    fn suppression_expires() {
        let book = PendingRaidBook::new();

        book.mark_suppressed("100", 300);
        assert!(book.is_suppressed("100"));
        assert!(!book.is_suppressed("999"));

        book.mark_suppressed("100", 0);
        assert!(!book.is_suppressed("100"));
    }
}
