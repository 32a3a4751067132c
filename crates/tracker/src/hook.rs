//! Capability seam between the tracker and whoever reacts to offline
//! transitions. The tracker depends on this trait, never on the raid
//! dispatcher's type.

use async_trait::async_trait;

/// An online→offline transition as published to subscribers.
#[derive(Debug, Clone)]
pub struct OfflineTransition {
    pub twitch_user_id: String,
    pub twitch_login: String,
    /// Last observed viewer count before the stream ended.
    pub viewer_count: i64,
    /// Length of the closed session.
    pub stream_duration_secs: i64,
}

#[async_trait]
pub trait OfflineHook: Send + Sync {
    async fn on_offline(&self, transition: OfflineTransition);
}

/// No-op hook for tests and for running the tracker stand-alone.
pub struct NullOfflineHook;

#[async_trait]
impl OfflineHook for NullOfflineHook {
    async fn on_offline(&self, _transition: OfflineTransition) {}
}
