//! Inbound event routing.
//!
//! The push-subscription endpoint is hosted elsewhere; whatever receives the
//! HTTP callbacks hands parsed notifications to [`EventRouter::route`], which
//! dispatches the types the core consumes and records the rest verbatim.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use streamnet_database::{EventRepository, StreamerRepository, StreamerUpsert};
use streamnet_raids::PendingRaidCorrelator;
use streamnet_tracker::LiveTracker;
use streamnet_twitch::{EventNotification, RaidEvent, StreamOfflineEvent, StreamOnlineEvent};
use tracing::{debug, info};

pub struct EventRouter {
    tracker: Arc<LiveTracker>,
    correlator: Arc<PendingRaidCorrelator>,
    streamers: StreamerRepository,
    history: EventRepository,
}

impl EventRouter {
    pub fn new(
        tracker: Arc<LiveTracker>,
        correlator: Arc<PendingRaidCorrelator>,
        streamers: StreamerRepository,
        history: EventRepository,
    ) -> Self {
        Self {
            tracker,
            correlator,
            streamers,
            history,
        }
    }

    pub async fn route(&self, notification: &EventNotification) -> Result<()> {
        match notification.subscription_type.as_str() {
            "stream.online" => {
                let event: StreamOnlineEvent =
                    serde_json::from_value(notification.event.clone())
                        .context("malformed stream.online payload")?;

                self.streamers
                    .ensure_observed(&StreamerUpsert {
                        twitch_login: event.broadcaster_user_login.clone(),
                        twitch_user_id: Some(event.broadcaster_user_id.clone()),
                    })
                    .await?;

                let started_at = event
                    .started_at
                    .as_deref()
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok());

                info!(login = %event.broadcaster_user_login, "stream.online received");
                self.tracker
                    .handle_online(
                        &event.broadcaster_user_id,
                        &event.broadcaster_user_login,
                        started_at,
                    )
                    .await?;
            }
            "stream.offline" => {
                let event: StreamOfflineEvent =
                    serde_json::from_value(notification.event.clone())
                        .context("malformed stream.offline payload")?;

                info!(login = %event.broadcaster_user_login, "stream.offline received");
                // The raid dispatcher fires through the tracker's offline hook.
                self.tracker.handle_offline(&event.broadcaster_user_id).await?;
            }
            "channel.raid" => {
                let event: RaidEvent = serde_json::from_value(notification.event.clone())
                    .context("malformed channel.raid payload")?;

                self.correlator.on_raid_arrival(&event).await?;
            }
            other => {
                debug!(event_type = other, "recording passthrough event");
                self.history
                    .record(
                        other,
                        notification.broadcaster_user_id(),
                        &notification.event,
                    )
                    .await?;
            }
        }

        Ok(())
    }
}
