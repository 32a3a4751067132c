//! EventSub notification payloads.
//!
//! The subscription endpoint itself is hosted elsewhere; it hands the core a
//! parsed [`EventNotification`] per inbound message.

use serde::Deserialize;
use serde_json::Value;

/// One inbound push notification: the subscription type plus its raw event
/// payload. The router decodes the payload into the typed events below for
/// the types the core consumes and records the rest verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct EventNotification {
    pub subscription_type: String,
    pub event: Value,
}

impl EventNotification {
    pub fn new(subscription_type: impl Into<String>, event: Value) -> Self {
        Self {
            subscription_type: subscription_type.into(),
            event,
        }
    }

    /// Best-effort broadcaster id for history rows.
    pub fn broadcaster_user_id(&self) -> Option<&str> {
        self.event
            .get("broadcaster_user_id")
            .or_else(|| self.event.get("to_broadcaster_user_id"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamOnlineEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamOfflineEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaidEvent {
    pub to_broadcaster_user_id: String,
    pub to_broadcaster_user_login: String,
    #[serde(default)]
    pub from_broadcaster_user_id: Option<String>,
    pub from_broadcaster_user_login: String,
    pub viewers: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raid_event_decodes_from_platform_payload() {
        let payload = serde_json::json!({
            "from_broadcaster_user_id": "100",
            "from_broadcaster_user_login": "alice",
            "from_broadcaster_user_name": "Alice",
            "to_broadcaster_user_id": "400",
            "to_broadcaster_user_login": "dave",
            "to_broadcaster_user_name": "Dave",
            "viewers": 38
        });

        let event: RaidEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.to_broadcaster_user_id, "400");
        assert_eq!(event.from_broadcaster_user_login, "alice");
        assert_eq!(event.viewers, 38);
    }

    #[test]
    fn notification_extracts_broadcaster_for_history() {
        let n = EventNotification::new(
            "channel.cheer",
            serde_json::json!({"broadcaster_user_id": "100", "bits": 50}),
        );
        assert_eq!(n.broadcaster_user_id(), Some("100"));

        let raid = EventNotification::new(
            "channel.raid",
            serde_json::json!({"to_broadcaster_user_id": "400"}),
        );
        assert_eq!(raid.broadcaster_user_id(), Some("400"));
    }
}
