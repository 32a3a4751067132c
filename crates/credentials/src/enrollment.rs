//! OAuth enrollment: the code-exchange path a broadcaster completes when
//! (re-)joining the program.
//!
//! The HTTP callback host lives outside the core; it verifies the `state`
//! parameter and hands the authorization code here.

use std::sync::Arc;

use streamnet_twitch::{HelixClient, TwitchOAuth};
use tracing::{info, warn};

use crate::notify::RoleSync;
use crate::repository::CredentialRepository;
use crate::types::{CredentialError, CredentialResult};

pub struct EnrollmentService {
    repo: CredentialRepository,
    oauth: Arc<TwitchOAuth>,
    helix: Arc<HelixClient>,
    role_sync: Arc<dyn RoleSync>,
    pool: sqlx::SqlitePool,
}

impl EnrollmentService {
    pub fn new(
        repo: CredentialRepository,
        oauth: Arc<TwitchOAuth>,
        helix: Arc<HelixClient>,
        role_sync: Arc<dyn RoleSync>,
        pool: sqlx::SqlitePool,
    ) -> Self {
        Self {
            repo,
            oauth,
            helix,
            role_sync,
            pool,
        }
    }

    /// Exchange an authorization code, persist the grant, and restore the
    /// partnership role if a linked guild account exists. Returns the login
    /// of the broadcaster who authorized.
    pub async fn complete_authorization(&self, code: &str) -> CredentialResult<String> {
        let grant = self
            .oauth
            .exchange_code(code)
            .await
            .map_err(|err| CredentialError::Identity(err.to_string()))?;

        let user = self
            .helix
            .current_user(&grant.access_token)
            .await
            .map_err(|err| CredentialError::Identity(err.to_string()))?;

        let Some(refresh_token) = grant.refresh_token.as_deref() else {
            warn!(login = %user.login, "code exchange returned no refresh token");
            return Err(CredentialError::GrantNotFound(user.login));
        };

        self.repo
            .save_grant(
                &user.id,
                &user.login,
                &grant.access_token,
                refresh_token,
                grant.expires_in_secs,
                &grant.scopes,
            )
            .await?;

        if let Some(discord_user_id) = self.discord_user_id(&user.id).await? {
            self.role_sync
                .grant_partner_role(&discord_user_id, "broadcaster completed authorization")
                .await;
        }

        info!(login = %user.login, "enrollment completed");
        Ok(user.login)
    }

    async fn discord_user_id(&self, twitch_user_id: &str) -> CredentialResult<Option<String>> {
        let id: Option<Option<String>> = sqlx::query_scalar(
            "SELECT discord_user_id FROM streamers WHERE twitch_user_id = ?",
        )
        .bind(twitch_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.flatten().filter(|id| !id.is_empty()))
    }
}
