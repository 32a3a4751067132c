//! Integration tests for raid dispatch and arrival correlation, driven
//! against a mocked platform API.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use httpmock::prelude::*;
use sqlx::SqlitePool;
use streamnet_config::{DatabaseConfig, PartnershipConfig, TwitchConfig};
use streamnet_credentials::{CredentialRepository, LoggingNotifier, TokenRefresher};
use streamnet_crypto::FieldCipher;
use streamnet_database::initialize_database;
use streamnet_raids::{
    ChatSink, DispatchOutcome, PendingRaidBook, PendingRaidCorrelator, RaidArrivalMessage,
    RaidDispatcher,
};
use streamnet_twitch::{AuthStateStore, HelixClient, RaidEvent, TwitchOAuth};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingChat {
    messages: Mutex<Vec<RaidArrivalMessage>>,
}

impl RecordingChat {
    fn messages(&self) -> Vec<RaidArrivalMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSink for RecordingChat {
    async fn post_raid_arrival(&self, message: RaidArrivalMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

struct Harness {
    pool: SqlitePool,
    repo: CredentialRepository,
    book: Arc<PendingRaidBook>,
    dispatcher: RaidDispatcher,
    correlator: PendingRaidCorrelator,
    chat: Arc<RecordingChat>,
    _tmp: TempDir,
}

async fn harness(server: &MockServer, twitch: TwitchConfig) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite:{}", tmp.path().join("test.db").display()),
        max_connections: 2,
    };
    let pool = initialize_database(&config).await.unwrap();

    let cipher =
        Arc::new(FieldCipher::from_keys([("v1".to_string(), vec![3u8; 32])], "v1").unwrap());
    let repo = CredentialRepository::new(pool.clone(), cipher, PartnershipConfig::default());

    let oauth = Arc::new(
        TwitchOAuth::with_endpoints(
            "client-id",
            "client-secret",
            "https://raid.example.com/callback",
            &server.url("/oauth2/authorize"),
            &server.url("/oauth2/token"),
        )
        .unwrap(),
    );
    let refresher = Arc::new(TokenRefresher::new(
        repo.clone(),
        oauth,
        Arc::new(LoggingNotifier),
        Arc::new(AuthStateStore::new()),
    ));

    let helix = Arc::new(HelixClient::with_endpoints(
        reqwest::Client::new(),
        "client-id",
        "client-secret",
        &server.url(""),
        &server.url("/oauth2/token"),
    ));

    let book = Arc::new(PendingRaidBook::new());
    let chat = Arc::new(RecordingChat::default());

    let dispatcher = RaidDispatcher::new(
        pool.clone(),
        book.clone(),
        refresher,
        helix,
        PartnershipConfig::default(),
        twitch,
    );
    let correlator = PendingRaidCorrelator::new(pool.clone(), book.clone(), chat.clone());

    Harness {
        pool,
        repo,
        book,
        dispatcher,
        correlator,
        chat,
        _tmp: tmp,
    }
}

/// Enroll a broadcaster (grant + partner flags) and mark them live.
async fn live_partner(h: &Harness, user_id: &str, login: &str, viewers: i64, started_mins_ago: i64) {
    h.repo
        .save_grant(user_id, login, &format!("tok-{login}"), "refresh", 14400, &[])
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO live_state \
         (twitch_user_id, streamer_login, is_live, active_session_id, last_started_at, \
          last_seen_at, last_viewer_count) \
         VALUES (?, ?, 1, 1, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(login)
    .bind((Utc::now() - Duration::minutes(started_mins_ago)).to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .bind(viewers)
    .execute(&h.pool)
    .await
    .unwrap();
}

async fn mock_followers(server: &MockServer, broadcaster_id: &str, total: Option<i64>) {
    let id = broadcaster_id.to_string();
    match total {
        Some(total) => {
            server.mock_async(move |when, then| {
                when.method(GET)
                    .path("/channels/followers")
                    .query_param("broadcaster_id", id.as_str());
                then.status(200)
                    .json_body(serde_json::json!({"total": total, "data": []}));
            }).await;
        }
        None => {
            server.mock_async(move |when, then| {
                when.method(GET)
                    .path("/channels/followers")
                    .query_param("broadcaster_id", id.as_str());
                then.status(401).body("unauthorized");
            }).await;
        }
    }
}

fn raid_event(to_id: &str, to_login: &str, from_id: Option<&str>, from_login: &str, viewers: i64) -> RaidEvent {
    RaidEvent {
        to_broadcaster_user_id: to_id.to_string(),
        to_broadcaster_user_login: to_login.to_string(),
        from_broadcaster_user_id: from_id.map(|s| s.to_string()),
        from_broadcaster_user_login: from_login.to_string(),
        viewers,
    }
}

#[tokio::test]
async fn offline_auto_raid_picks_smallest_with_follower_tiebreak() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "200", "bob", 10, 60).await;
    live_partner(&h, "300", "carol", 10, 90).await;
    live_partner(&h, "400", "dave", 10, 30).await;

    mock_followers(&server, "200", None).await;
    mock_followers(&server, "300", Some(500)).await;
    mock_followers(&server, "400", Some(200)).await;

    let raid_mock = server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("from_broadcaster_id", "100")
            .query_param("to_broadcaster_id", "400");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Raided {
            target_login: "dave".to_string()
        }
    );
    raid_mock.assert_async().await;

    let attempts = h.dispatcher.history().recent_attempts("100", 10).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert_eq!(attempts[0].to_broadcaster_login, "dave");
    assert_eq!(attempts[0].viewer_count, 42);
    assert_eq!(attempts[0].candidates_count, 3);
    assert_eq!(attempts[0].reason, "auto_raid_on_offline");

    let pending = h.book.peek("400").expect("pending raid must be registered");
    assert_eq!(pending.from_login, "alice");
    assert!(pending.partner_raid);
    assert_eq!(pending.viewer_count, 42);
}

#[tokio::test]
async fn arrival_correlation_consumes_pending_and_messages_once() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 10, 30).await;
    mock_followers(&server, "400", Some(200)).await;
    server.mock_async(|when, then| {
        when.method(POST).path("/raids");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Raided { .. }));

    let event = raid_event("400", "dave", Some("100"), "alice", 38);
    h.correlator.on_raid_arrival(&event).await.unwrap();

    let messages = h.chat.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].to_broadcaster_login, "dave");
    assert_eq!(messages[0].from_broadcaster_login, "alice");
    assert_eq!(messages[0].viewer_count, 38);
    assert!(messages[0].partner_raid);
    assert_eq!(messages[0].network_raid_number, 1);

    assert_eq!(h.book.pending_count(), 0);

    // A duplicate arrival produces no second message.
    h.correlator.on_raid_arrival(&event).await.unwrap();
    assert_eq!(h.chat.messages().len(), 1);
}

#[tokio::test]
async fn origin_mismatch_leaves_pending_entry() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 10, 30).await;
    mock_followers(&server, "400", Some(200)).await;
    server.mock_async(|when, then| {
        when.method(POST).path("/raids");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    h.dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    let imposter = raid_event("400", "dave", Some("666"), "mallory", 5);
    h.correlator.on_raid_arrival(&imposter).await.unwrap();

    assert!(h.chat.messages().is_empty());
    assert_eq!(h.book.pending_count(), 1, "mismatch must keep the entry");

    let genuine = raid_event("400", "dave", Some("100"), "alice", 38);
    h.correlator.on_raid_arrival(&genuine).await.unwrap();
    assert_eq!(h.chat.messages().len(), 1);
}

#[tokio::test]
async fn external_raid_suppresses_the_next_offline_auto_raid() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 50, 120).await;
    live_partner(&h, "400", "dave", 10, 30).await;

    // No pending entry for erin: this raid was started by a human.
    let event = raid_event("900", "erin", Some("100"), "alice", 50);
    h.correlator.on_raid_arrival(&event).await.unwrap();

    assert!(h.book.is_suppressed("100"));
    assert!(h.chat.messages().is_empty());

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 50, 7200)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Suppressed);

    let attempts = h.dispatcher.history().recent_attempts("100", 10).await.unwrap();
    assert!(attempts.is_empty(), "suppressed trigger writes no history");
}

#[tokio::test]
async fn external_raid_origin_is_resolved_from_login_when_id_missing() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 50, 120).await;

    let event = raid_event("900", "erin", None, "alice", 50);
    h.correlator.on_raid_arrival(&event).await.unwrap();

    assert!(h.book.is_suppressed("100"));
}

#[tokio::test]
async fn partner_refusal_retries_without_blacklisting() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 5, 30).await;
    live_partner(&h, "300", "carol", 10, 90).await;
    mock_followers(&server, "400", Some(200)).await;
    mock_followers(&server, "300", Some(500)).await;

    server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("to_broadcaster_id", "400");
        then.status(400).json_body(serde_json::json!({
            "error": "Bad Request",
            "status": 400,
            "message": "The targeted channel's settings do not allow you to raid them"
        }));
    }).await;
    let carol_mock = server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("to_broadcaster_id", "300");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Raided {
            target_login: "carol".to_string()
        }
    );
    carol_mock.assert_async().await;

    // Two history rows: the refused attempt and the success.
    let attempts = h.dispatcher.history().recent_attempts("100", 10).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[1].error_message.is_some());
    assert!(!attempts[1].success);
    assert!(attempts[0].success);

    // Partner opt-outs never land on the blacklist.
    assert!(!h
        .dispatcher
        .history()
        .is_blacklisted("400", "dave")
        .await
        .unwrap());
}

#[tokio::test]
async fn category_fallback_refusal_is_blacklisted() {
    let server = MockServer::start_async().await;
    let twitch = TwitchConfig {
        tracked_category_id: Some("12345".to_string()),
        ..TwitchConfig::default()
    };
    let h = harness(&server, twitch).await;

    // Only the origin is enrolled; no partners online.
    live_partner(&h, "100", "alice", 42, 120).await;
    sqlx::query("UPDATE live_state SET is_live = 0 WHERE twitch_user_id = '100'")
        .execute(&h.pool)
        .await
        .unwrap();

    server.mock_async(|when, then| {
        when.method(POST).path("/oauth2/token");
        then.status(200).json_body(serde_json::json!({
            "access_token": "app-token", "expires_in": 3600, "token_type": "bearer"
        }));
    }).await;
    server.mock_async(|when, then| {
        when.method(GET).path("/streams").query_param("game_id", "12345");
        then.status(200).json_body(serde_json::json!({
            "data": [
                {"user_id": "700", "user_login": "frank", "viewer_count": 3,
                 "started_at": "2024-05-01T18:00:00Z", "language": "de"},
                {"user_id": "800", "user_login": "grace", "viewer_count": 8,
                 "started_at": "2024-05-01T18:30:00Z", "language": "de"}
            ]
        }));
    }).await;

    server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("to_broadcaster_id", "700");
        then.status(400).json_body(serde_json::json!({
            "status": 400, "message": "channel is not accepting raids"
        }));
    }).await;
    let grace_mock = server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("to_broadcaster_id", "800");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Raided {
            target_login: "grace".to_string()
        }
    );
    grace_mock.assert_async().await;

    assert!(h
        .dispatcher
        .history()
        .is_blacklisted("700", "frank")
        .await
        .unwrap());

    let pending = h.book.peek("800").unwrap();
    assert!(!pending.partner_raid, "category fallback raids are not partner raids");
}

#[tokio::test]
async fn recent_target_is_avoided_while_alternatives_remain() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 5, 30).await;
    live_partner(&h, "300", "carol", 10, 90).await;
    mock_followers(&server, "400", Some(200)).await;
    mock_followers(&server, "300", Some(500)).await;

    // Alice raided dave two days ago.
    sqlx::query(
        "INSERT INTO raid_history \
         (from_broadcaster_id, from_broadcaster_login, to_broadcaster_id, \
          to_broadcaster_login, viewer_count, success, executed_at) \
         VALUES ('100', 'alice', '400', 'dave', 30, 1, ?)",
    )
    .bind((Utc::now() - Duration::days(2)).to_rfc3339())
    .execute(&h.pool)
    .await
    .unwrap();

    let carol_mock = server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("to_broadcaster_id", "300");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Raided {
            target_login: "carol".to_string()
        }
    );
    carol_mock.assert_async().await;
}

#[tokio::test]
async fn recent_target_is_still_used_when_it_is_the_only_option() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 5, 30).await;
    mock_followers(&server, "400", Some(200)).await;

    sqlx::query(
        "INSERT INTO raid_history \
         (from_broadcaster_id, from_broadcaster_login, to_broadcaster_id, \
          to_broadcaster_login, viewer_count, success, executed_at) \
         VALUES ('100', 'alice', '400', 'dave', 30, 1, ?)",
    )
    .bind((Utc::now() - Duration::days(2)).to_rfc3339())
    .execute(&h.pool)
    .await
    .unwrap();

    let dave_mock = server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("to_broadcaster_id", "400");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DispatchOutcome::Raided {
            target_login: "dave".to_string()
        }
    );
    dave_mock.assert_async().await;
}

#[tokio::test]
async fn manual_dispatch_marks_suppression_for_the_offline_event() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 5, 30).await;
    mock_followers(&server, "400", Some(200)).await;
    server.mock_async(|when, then| {
        when.method(POST).path("/raids");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    let outcome = h
        .dispatcher
        .dispatch_manual("100", "alice", 42, 7200)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Raided { .. }));

    let attempts = h.dispatcher.history().recent_attempts("100", 10).await.unwrap();
    assert_eq!(attempts[0].reason, "manual_chat_command");

    // The stream ends moments later; the auto-raid stands down.
    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Suppressed);
}

#[tokio::test]
async fn disabled_origin_is_not_eligible() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 5, 30).await;
    h.repo.set_raid_enabled("100", false).await.unwrap();

    let outcome = h
        .dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::NotEligible);
}

#[tokio::test]
async fn silent_raid_target_gets_no_chat_message() {
    let server = MockServer::start_async().await;
    let h = harness(&server, TwitchConfig::default()).await;

    live_partner(&h, "100", "alice", 42, 120).await;
    live_partner(&h, "400", "dave", 10, 30).await;
    mock_followers(&server, "400", Some(200)).await;
    server.mock_async(|when, then| {
        when.method(POST).path("/raids");
        then.status(200).json_body(serde_json::json!({"data": []}));
    }).await;

    sqlx::query("UPDATE streamers SET silent_raid = 1 WHERE twitch_login = 'dave'")
        .execute(&h.pool)
        .await
        .unwrap();

    h.dispatcher
        .dispatch_on_offline("100", "alice", 42, 7200)
        .await
        .unwrap();

    let event = raid_event("400", "dave", Some("100"), "alice", 38);
    h.correlator.on_raid_arrival(&event).await.unwrap();

    assert!(h.chat.messages().is_empty());
    assert_eq!(h.book.pending_count(), 0, "entry is consumed even when silent");
}
