//! End-to-end flow against a mocked platform: enrollment, a poll tick, the
//! offline auto-raid, and the arrival correlation: the whole lifecycle in
//! one process.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use httpmock::prelude::*;
use serde_json::json;
use streamnet_config::AppConfig;
use streamnet_credentials::LoggingNotifier;
use streamnet_crypto::FieldCipher;
use streamnet_database::initialize_database;
use streamnet_raids::{ChatSink, RaidArrivalMessage};
use streamnet_runtime::{poll::poll_once, Collaborators, EventRouter, Services};
use streamnet_twitch::EventNotification;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingChat {
    messages: Mutex<Vec<RaidArrivalMessage>>,
}

#[async_trait]
impl ChatSink for RecordingChat {
    async fn post_raid_arrival(&self, message: RaidArrivalMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

struct TestApp {
    services: Arc<Services>,
    chat: Arc<RecordingChat>,
    _db_dir: TempDir,
}

impl TestApp {
    async fn new(server: &MockServer) -> Self {
        let db_dir = TempDir::new().expect("create temp dir");
        let db_path = db_dir.path().join("streamnet-test.db");

        let mut config = AppConfig::default();
        config.database.url = format!("sqlite://{}", db_path.to_string_lossy());
        config.database.max_connections = 5;
        config.twitch.client_id = Some("client-id".to_string());
        config.twitch.client_secret = Some("client-secret".to_string());
        config.twitch.redirect_uri = Some("https://raid.example.com/callback".to_string());
        config.twitch.api_base_url = Some(server.url(""));
        config.twitch.id_base_url = Some(server.url(""));

        let pool = initialize_database(&config.database).await.unwrap();
        let cipher =
            Arc::new(FieldCipher::from_keys([("v1".to_string(), vec![9u8; 32])], "v1").unwrap());

        let chat = Arc::new(RecordingChat::default());
        let logging = Arc::new(LoggingNotifier);
        let collaborators = Collaborators {
            notifier: logging.clone(),
            role_sync: logging,
            chat: chat.clone(),
        };

        let services = Arc::new(
            Services::with_parts(&config, collaborators, pool, cipher)
                .await
                .expect("services must compose"),
        );

        Self {
            services,
            chat,
            _db_dir: db_dir,
        }
    }

    fn router(&self) -> &EventRouter {
        &self.services.router
    }
}

async fn mock_platform(server: &MockServer) {
    // Client-credentials app token for the query endpoints.
    server.mock_async(|when, then| {
        when.method(POST).path("/oauth2/token");
        then.status(200).json_body(json!({
            "access_token": "app-token",
            "expires_in": 3600,
            "token_type": "bearer"
        }));
    }).await;

    // Both tracked logins are live.
    server.mock_async(|when, then| {
        when.method(GET).path("/streams");
        then.status(200).json_body(json!({
            "data": [
                {"user_id": "100", "user_login": "alice", "user_name": "Alice",
                 "game_id": "12345", "title": "ranked", "viewer_count": 42,
                 "started_at": "2024-05-01T18:00:00Z", "language": "de"},
                {"user_id": "400", "user_login": "dave", "user_name": "Dave",
                 "game_id": "12345", "title": "chill", "viewer_count": 10,
                 "started_at": "2024-05-01T19:00:00Z", "language": "de"}
            ]
        }));
    }).await;

    server.mock_async(|when, then| {
        when.method(GET)
            .path("/channels/followers")
            .query_param("broadcaster_id", "400");
        then.status(200).json_body(json!({"total": 200, "data": []}));
    }).await;
}

#[tokio::test]
async fn offline_auto_raid_flows_end_to_end() {
    let server = MockServer::start_async().await;
    mock_platform(&server).await;

    let raid_mock = server.mock_async(|when, then| {
        when.method(POST)
            .path("/raids")
            .query_param("from_broadcaster_id", "100")
            .query_param("to_broadcaster_id", "400");
        then.status(200).json_body(json!({"data": []}));
    }).await;

    let app = TestApp::new(&server).await;

    // Both broadcasters are enrolled partners.
    app.services
        .credentials
        .save_grant("100", "alice", "tok-alice", "ref-alice", 14400, &[])
        .await
        .unwrap();
    app.services
        .credentials
        .save_grant("400", "dave", "tok-dave", "ref-dave", 14400, &[])
        .await
        .unwrap();

    // One poll tick observes both live and opens their sessions.
    let live = poll_once(&app.services).await.unwrap();
    assert_eq!(live, 2);
    assert!(app
        .services
        .tracker
        .active_session_id("alice")
        .await
        .unwrap()
        .is_some());

    // Alice ends her stream; the dispatcher raids dave through the hook.
    app.router()
        .route(&EventNotification::new(
            "stream.offline",
            json!({"broadcaster_user_id": "100", "broadcaster_user_login": "alice"}),
        ))
        .await
        .unwrap();

    raid_mock.assert_async().await;
    assert!(app
        .services
        .tracker
        .active_session_id("alice")
        .await
        .unwrap()
        .is_none());

    let attempts = app
        .services
        .dispatcher
        .history()
        .recent_attempts("100", 10)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert_eq!(attempts[0].to_broadcaster_login, "dave");
    assert_eq!(attempts[0].viewer_count, 42);

    // The raid arrives at dave; the correlator posts the partner message.
    app.router()
        .route(&EventNotification::new(
            "channel.raid",
            json!({
                "from_broadcaster_user_id": "100",
                "from_broadcaster_user_login": "alice",
                "to_broadcaster_user_id": "400",
                "to_broadcaster_user_login": "dave",
                "viewers": 38
            }),
        ))
        .await
        .unwrap();

    let messages = app.chat.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].to_broadcaster_login, "dave");
    assert!(messages[0].partner_raid);
    assert_eq!(messages[0].network_raid_number, 1);
}

#[tokio::test]
async fn external_raid_suppresses_the_auto_raid_end_to_end() {
    let server = MockServer::start_async().await;
    mock_platform(&server).await;

    let raid_mock = server.mock_async(|when, then| {
        when.method(POST).path("/raids");
        then.status(200).json_body(json!({"data": []}));
    }).await;

    let app = TestApp::new(&server).await;

    app.services
        .credentials
        .save_grant("100", "alice", "tok-alice", "ref-alice", 14400, &[])
        .await
        .unwrap();
    app.services
        .credentials
        .save_grant("400", "dave", "tok-dave", "ref-dave", 14400, &[])
        .await
        .unwrap();

    poll_once(&app.services).await.unwrap();

    // A human raid from alice to someone outside the network.
    app.router()
        .route(&EventNotification::new(
            "channel.raid",
            json!({
                "from_broadcaster_user_id": "100",
                "from_broadcaster_user_login": "alice",
                "to_broadcaster_user_id": "900",
                "to_broadcaster_user_login": "erin",
                "viewers": 50
            }),
        ))
        .await
        .unwrap();

    // Her offline event inside the suppression window fires no auto-raid.
    app.router()
        .route(&EventNotification::new(
            "stream.offline",
            json!({"broadcaster_user_id": "100", "broadcaster_user_login": "alice"}),
        ))
        .await
        .unwrap();

    raid_mock.assert_hits_async(0).await;
    assert!(app
        .services
        .dispatcher
        .history()
        .recent_attempts("100", 10)
        .await
        .unwrap()
        .is_empty());
}
