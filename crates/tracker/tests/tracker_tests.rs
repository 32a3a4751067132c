//! Integration tests for the live-state tracker: transitions, miss counting,
//! invariants, and rehydration.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use streamnet_config::DatabaseConfig;
use streamnet_database::initialize_database;
use streamnet_tracker::{LiveTracker, OfflineHook, OfflineTransition, TrackerError};
use streamnet_twitch::StreamInfo;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingHook {
    transitions: Mutex<Vec<OfflineTransition>>,
}

impl RecordingHook {
    fn transitions(&self) -> Vec<OfflineTransition> {
        self.transitions.lock().unwrap().clone()
    }
}

#[async_trait]
impl OfflineHook for RecordingHook {
    async fn on_offline(&self, transition: OfflineTransition) {
        self.transitions.lock().unwrap().push(transition);
    }
}

fn stream(user_id: &str, login: &str, viewers: i64) -> StreamInfo {
    StreamInfo {
        id: format!("stream-{user_id}"),
        user_id: user_id.to_string(),
        user_login: login.to_string(),
        user_name: login.to_string(),
        game_id: "12345".to_string(),
        game_name: "Deadlock".to_string(),
        title: format!("{login} live"),
        viewer_count: viewers,
        started_at: (Utc::now() - Duration::minutes(5)).to_rfc3339(),
        language: "de".to_string(),
    }
}

async fn setup(miss_threshold: u32) -> (LiveTracker, Arc<RecordingHook>, SqlitePool, TempDir) {
    let tmp = TempDir::new().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite:{}", tmp.path().join("test.db").display()),
        max_connections: 1,
    };
    let pool = initialize_database(&config).await.unwrap();
    let hook = Arc::new(RecordingHook::default());
    let tracker = LiveTracker::new(pool.clone(), hook.clone(), miss_threshold);
    (tracker, hook, pool, tmp)
}

async fn live_state(pool: &SqlitePool, user_id: &str) -> (bool, Option<i64>, i64) {
    let row = sqlx::query(
        "SELECT is_live, active_session_id, last_viewer_count FROM live_state \
         WHERE twitch_user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .unwrap();
    (
        row.get("is_live"),
        row.get("active_session_id"),
        row.get("last_viewer_count"),
    )
}

#[tokio::test]
async fn snapshot_opens_session_and_samples_on_reobservation() {
    let (tracker, _hook, pool, _tmp) = setup(2).await;

    tracker.handle_snapshot(&[stream("100", "alice", 42)]).await.unwrap();

    let (is_live, session_id, viewers) = live_state(&pool, "100").await;
    assert!(is_live);
    let session_id = session_id.expect("active session id must be set while live");
    assert_eq!(viewers, 42);

    // Invariant: the active session is open and belongs to the broadcaster.
    let session = tracker.sessions().find(session_id).await.unwrap().unwrap();
    assert!(session.ended_at.is_none());
    assert_eq!(session.streamer_login, "alice");
    assert_eq!(session.start_viewers, 42);

    tracker.handle_snapshot(&[stream("100", "alice", 55)]).await.unwrap();

    let (_, same_session, viewers) = live_state(&pool, "100").await;
    assert_eq!(same_session, Some(session_id), "re-observation must not reopen");
    assert_eq!(viewers, 55);

    let session = tracker.sessions().find(session_id).await.unwrap().unwrap();
    assert_eq!(session.peak_viewers, 55);
}

#[tokio::test]
async fn offline_event_closes_session_and_notifies_hook() {
    let (tracker, hook, pool, _tmp) = setup(2).await;

    tracker.handle_snapshot(&[stream("100", "alice", 42)]).await.unwrap();
    let (_, session_id, _) = live_state(&pool, "100").await;
    let session_id = session_id.unwrap();

    tracker.handle_offline("100").await.unwrap();

    let (is_live, active, _) = live_state(&pool, "100").await;
    assert!(!is_live);
    assert!(active.is_none());

    let session = tracker.sessions().find(session_id).await.unwrap().unwrap();
    assert!(session.ended_at.is_some());

    let transitions = hook.transitions();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].twitch_login, "alice");
    assert_eq!(transitions[0].viewer_count, 42);

    // Second offline is a no-op: no extra transition, no mutation.
    tracker.handle_offline("100").await.unwrap();
    assert_eq!(hook.transitions().len(), 1);
}

#[tokio::test]
async fn absence_needs_consecutive_misses_before_offline() {
    let (tracker, hook, pool, _tmp) = setup(2).await;

    tracker.handle_snapshot(&[stream("100", "alice", 30)]).await.unwrap();

    // First empty snapshot: one miss, still live.
    tracker.handle_snapshot(&[]).await.unwrap();
    let (is_live, _, _) = live_state(&pool, "100").await;
    assert!(is_live);
    assert!(hook.transitions().is_empty());

    // Second consecutive miss crosses the threshold.
    tracker.handle_snapshot(&[]).await.unwrap();
    let (is_live, _, _) = live_state(&pool, "100").await;
    assert!(!is_live);
    assert_eq!(hook.transitions().len(), 1);
}

#[tokio::test]
async fn reappearance_resets_the_miss_counter() {
    let (tracker, hook, pool, _tmp) = setup(2).await;

    tracker.handle_snapshot(&[stream("100", "alice", 30)]).await.unwrap();
    tracker.handle_snapshot(&[]).await.unwrap();
    tracker.handle_snapshot(&[stream("100", "alice", 28)]).await.unwrap();
    tracker.handle_snapshot(&[]).await.unwrap();

    let (is_live, _, _) = live_state(&pool, "100").await;
    assert!(is_live, "a single miss after reappearing must not close");
    assert!(hook.transitions().is_empty());
}

#[tokio::test]
async fn one_live_state_row_per_broadcaster() {
    let (tracker, _hook, pool, _tmp) = setup(2).await;

    tracker.handle_snapshot(&[stream("100", "alice", 10)]).await.unwrap();
    tracker.handle_offline("100").await.unwrap();
    tracker
        .handle_online("100", "alice", Some(Utc::now()))
        .await
        .unwrap();

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM live_state WHERE twitch_user_id = '100'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    // Two sessions exist: the closed one and the new open one.
    let sessions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM stream_sessions WHERE streamer_login = 'alice'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(sessions, 2);

    let open: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM stream_sessions \
         WHERE streamer_login = 'alice' AND ended_at IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(open, 1);
}

#[tokio::test]
async fn rehydration_closes_stale_sessions_and_resumes_live_ones() {
    let (tracker, _hook, pool, _tmp) = setup(2).await;

    tracker
        .handle_snapshot(&[stream("100", "alice", 10), stream("200", "bob", 20)])
        .await
        .unwrap();

    // Simulate a restart: a fresh tracker adopts the open sessions. Alice is
    // still live, bob is not.
    let hook2 = Arc::new(RecordingHook::default());
    let restarted = LiveTracker::new(pool.clone(), hook2.clone(), 2);
    restarted
        .rehydrate(&[stream("100", "alice", 12)])
        .await
        .unwrap();

    let (alice_live, alice_session, _) = live_state(&pool, "100").await;
    assert!(alice_live);
    assert!(alice_session.is_some());

    let (bob_live, bob_session, _) = live_state(&pool, "200").await;
    assert!(!bob_live);
    assert!(bob_session.is_none());

    let open: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM stream_sessions WHERE ended_at IS NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(open, 1);
}

#[tokio::test]
async fn chat_messages_require_an_open_session() {
    let (tracker, _hook, _pool, _tmp) = setup(2).await;

    let err = tracker.record_chat_message("alice", "bob").await.unwrap_err();
    assert!(matches!(err, TrackerError::NoOpenSession(_)));

    tracker.handle_snapshot(&[stream("100", "alice", 5)]).await.unwrap();
    tracker.record_chat_message("alice", "bob").await.unwrap();

    let session_id = tracker.active_session_id("alice").await.unwrap().unwrap();
    tracker.handle_offline("100").await.unwrap();

    let session = tracker.sessions().find(session_id).await.unwrap().unwrap();
    assert_eq!(session.unique_chatters, 1);
    assert_eq!(session.first_time_chatters, 1);
}
