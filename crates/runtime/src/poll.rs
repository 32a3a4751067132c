//! The periodic live-state poll.
//!
//! Every tick merges two snapshots: streams live in the tracked category and
//! streams for the explicitly tracked logins. The merged set drives the
//! tracker's state transitions.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use streamnet_twitch::StreamInfo;

use crate::Services;

pub async fn poll_loop(services: &Services, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(services.config.partnership.poll_interval_secs.max(10));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("live-state poll stopping");
                    return;
                }
                continue;
            }
        }

        match poll_once(services).await {
            Ok(count) => debug!(live = count, "poll tick complete"),
            Err(err) => error!(?err, "poll tick failed"),
        }
    }
}

/// One poll tick. Returns the number of live streams observed.
pub async fn poll_once(services: &Services) -> anyhow::Result<usize> {
    let mut merged: Vec<StreamInfo> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if let Some(category_id) = services.config.twitch.tracked_category_id.as_deref() {
        let category = services
            .helix
            .streams_by_category(category_id, Some(&services.config.twitch.language), 100)
            .await?;
        for stream in category {
            if seen.insert(stream.user_id.clone()) {
                merged.push(stream);
            }
        }
    }

    let logins = services.streamers.tracked_logins().await?;
    if !logins.is_empty() {
        let tracked = services.helix.streams_by_logins(&logins).await?;
        for stream in tracked {
            if seen.insert(stream.user_id.clone()) {
                merged.push(stream);
            }
        }
    }

    let count = merged.len();
    services.tracker.handle_snapshot(&merged).await?;
    Ok(count)
}
