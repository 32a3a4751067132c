//! Append-only platform event record.

use serde::{Deserialize, Serialize};

/// A passthrough platform notification persisted for later analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub broadcaster_user_id: Option<String>,
    pub payload: String,
    pub received_at: String,
}
