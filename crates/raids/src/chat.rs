//! Capability seam toward the chat bot that posts post-raid messages.
//! Wording is owned by the implementation; the core only supplies facts.

use async_trait::async_trait;
use tracing::info;

/// Facts for the message posted in the target's chat after a dispatched raid
/// arrived.
#[derive(Debug, Clone)]
pub struct RaidArrivalMessage {
    pub to_broadcaster_id: String,
    pub to_broadcaster_login: String,
    pub from_broadcaster_login: String,
    pub viewer_count: i64,
    /// Raid between two partnered broadcasters; selects the partner wording.
    pub partner_raid: bool,
    /// How many network raids the target has received, this one included.
    pub network_raid_number: i64,
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn post_raid_arrival(&self, message: RaidArrivalMessage);
}

/// Default sink that only logs; the chat bot surface lives outside the core.
pub struct LoggingChatSink;

#[async_trait]
impl ChatSink for LoggingChatSink {
    async fn post_raid_arrival(&self, message: RaidArrivalMessage) {
        info!(
            to = %message.to_broadcaster_login,
            from = %message.from_broadcaster_login,
            viewers = message.viewer_count,
            partner = message.partner_raid,
            nth = message.network_raid_number,
            "post-raid chat message"
        );
    }
}
