//! Runtime composition for the Streamnet backend: telemetry, the services
//! graph, inbound event routing, and supervised background tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use streamnet_config::AppConfig;
use streamnet_credentials::{
    CredentialRepository, EnrollmentService, GraceController, PartnerNotifier, RoleSync,
    TokenRefresher,
};
use streamnet_crypto::FieldCipher;
use streamnet_database::{initialize_database, EventRepository, StreamerRepository};
use streamnet_raids::{ChatSink, PendingRaidBook, PendingRaidCorrelator, RaidDispatcher};
use streamnet_tracker::LiveTracker;
use streamnet_twitch::{AuthStateStore, HelixClient, TwitchOAuth};

pub mod events;
pub mod poll;
pub mod tasks;

pub use events::EventRouter;
pub use tasks::TaskSupervisor;

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::INFO)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// External collaborators the binary attaches: community notifications, role
/// sync, and the chat bot. Default to logging implementations.
pub struct Collaborators {
    pub notifier: Arc<dyn PartnerNotifier>,
    pub role_sync: Arc<dyn RoleSync>,
    pub chat: Arc<dyn ChatSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let logging = Arc::new(streamnet_credentials::LoggingNotifier);
        Self {
            notifier: logging.clone(),
            role_sync: logging,
            chat: Arc::new(streamnet_raids::LoggingChatSink),
        }
    }
}

/// The composed service graph. Everything is constructed here, at the
/// composition root, and passed down; no component reaches for globals.
pub struct Services {
    pub config: AppConfig,
    pub db_pool: SqlitePool,
    pub streamers: StreamerRepository,
    pub event_history: EventRepository,
    pub credentials: CredentialRepository,
    pub refresher: Arc<TokenRefresher>,
    pub grace: Arc<GraceController>,
    pub enrollment: Arc<EnrollmentService>,
    pub tracker: Arc<LiveTracker>,
    pub dispatcher: Arc<RaidDispatcher>,
    pub correlator: Arc<PendingRaidCorrelator>,
    pub router: Arc<EventRouter>,
    pub helix: Arc<HelixClient>,
    pub oauth: Arc<TwitchOAuth>,
    pub auth_states: Arc<AuthStateStore>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    pub async fn initialise(config: &AppConfig, collaborators: Collaborators) -> Result<Self> {
        let db_pool = initialize_database(&config.database)
            .await
            .context("failed to initialise database")?;

        let cipher = Arc::new(
            FieldCipher::from_vault(&config.crypto.vault_service, &config.crypto.master_key_id)
                .context("failed to load field encryption key from the OS vault")?,
        );

        Self::with_parts(config, collaborators, db_pool, cipher).await
    }

    /// Composition with pre-built pool and cipher. Lets tests inject key
    /// material without an OS vault.
    pub async fn with_parts(
        config: &AppConfig,
        collaborators: Collaborators,
        db_pool: SqlitePool,
        cipher: Arc<FieldCipher>,
    ) -> Result<Self> {
        let client_id = config
            .twitch
            .client_id
            .as_deref()
            .context("twitch.client_id is not configured")?;
        let client_secret = config
            .twitch
            .client_secret
            .as_deref()
            .context("twitch.client_secret is not configured")?;
        let redirect_uri = config
            .twitch
            .redirect_uri
            .as_deref()
            .context("twitch.redirect_uri is not configured")?;

        let http = HelixClient::default_http_client();
        let helix = match (&config.twitch.api_base_url, &config.twitch.id_base_url) {
            (Some(api_base), Some(id_base)) => Arc::new(HelixClient::with_endpoints(
                http,
                client_id,
                client_secret,
                api_base,
                &format!("{}/oauth2/token", id_base.trim_end_matches('/')),
            )),
            _ => Arc::new(HelixClient::new(http, client_id, client_secret)),
        };
        let oauth = match &config.twitch.id_base_url {
            Some(id_base) => {
                let id_base = id_base.trim_end_matches('/');
                Arc::new(
                    TwitchOAuth::with_endpoints(
                        client_id,
                        client_secret,
                        redirect_uri,
                        &format!("{id_base}/oauth2/authorize"),
                        &format!("{id_base}/oauth2/token"),
                    )
                    .context("failed to build oauth client")?,
                )
            }
            None => Arc::new(
                TwitchOAuth::new(client_id, client_secret, redirect_uri)
                    .context("failed to build oauth client")?,
            ),
        };
        let auth_states = Arc::new(AuthStateStore::new());

        let streamers = StreamerRepository::new(db_pool.clone());
        let event_history = EventRepository::new(db_pool.clone());
        let credentials =
            CredentialRepository::new(db_pool.clone(), cipher, config.partnership.clone());

        let refresher = Arc::new(TokenRefresher::new(
            credentials.clone(),
            oauth.clone(),
            collaborators.notifier.clone(),
            auth_states.clone(),
        ));

        let grace = Arc::new(GraceController::new(
            credentials.clone(),
            db_pool.clone(),
            oauth.clone(),
            auth_states.clone(),
            collaborators.notifier.clone(),
            collaborators.role_sync.clone(),
        ));

        let enrollment = Arc::new(EnrollmentService::new(
            credentials.clone(),
            oauth.clone(),
            helix.clone(),
            collaborators.role_sync.clone(),
            db_pool.clone(),
        ));

        let book = Arc::new(PendingRaidBook::new());

        let dispatcher = Arc::new(RaidDispatcher::new(
            db_pool.clone(),
            book.clone(),
            refresher.clone(),
            helix.clone(),
            config.partnership.clone(),
            config.twitch.clone(),
        ));

        let tracker = Arc::new(LiveTracker::new(
            db_pool.clone(),
            dispatcher.clone(),
            config.partnership.offline_miss_threshold,
        ));

        let correlator = Arc::new(PendingRaidCorrelator::new(
            db_pool.clone(),
            book,
            collaborators.chat.clone(),
        ));

        let router = Arc::new(EventRouter::new(
            tracker.clone(),
            correlator.clone(),
            streamers.clone(),
            event_history.clone(),
        ));

        let overview = credentials.overview().await?;
        info!(
            grants = overview.total,
            raid_enabled = overview.raid_enabled,
            needs_reauth = overview.needs_reauth,
            "credential store ready"
        );

        Ok(Self {
            config: config.clone(),
            db_pool,
            streamers,
            event_history,
            credentials,
            refresher,
            grace,
            enrollment,
            tracker,
            dispatcher,
            correlator,
            router,
            helix,
            oauth,
            auth_states,
        })
    }

    /// Adopt sessions left open by a previous process: query current
    /// liveness for the tracked logins and resume or close accordingly.
    pub async fn rehydrate(&self) -> Result<()> {
        let logins = self.streamers.tracked_logins().await?;
        let live = if logins.is_empty() {
            Vec::new()
        } else {
            self.helix
                .streams_by_logins(&logins)
                .await
                .context("liveness query during rehydration failed")?
        };

        self.tracker.rehydrate(&live).await?;
        info!(live = live.len(), tracked = logins.len(), "session rehydration complete");
        Ok(())
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
